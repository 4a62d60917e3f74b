//! Tabela de thresholds – limite numérico por métrica.
//!
//! Montada uma única vez no startup a partir das chaves com o prefixo de
//! threshold e imutável depois disso. É compartilhada via `Arc` e lida sem
//! lock pelas threads de conexão.

use crate::config::{ConfigError, ServerConfig};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Limites por métrica (nome base, sem sufixo).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdTable {
    limits: BTreeMap<String, f64>,
}

impl ThresholdTable {
    /// Cria a tabela a partir de pares `(métrica, limite)`.
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            limits: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Carrega os thresholds da configuração do servidor.
    ///
    /// Valor vazio desativa a métrica; valor inválido é registrado e a
    /// métrica fica de fora, sem abortar o startup.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut limits = BTreeMap::new();

        for (metric, raw) in config.threshold_entries() {
            let key = format!("{}{metric}", config.prefix_of_threshold_value);
            if metric.is_empty() {
                warn!("Chave `{key}` sem nome de métrica, ignorada");
                continue;
            }
            match parse_limit(&key, raw) {
                Ok(Some(limit)) => {
                    limits.insert(metric.to_string(), limit);
                }
                Ok(None) => debug!("Threshold `{key}` vazio, métrica desativada"),
                Err(e) => warn!("{e}; métrica `{metric}` ignorada"),
            }
        }

        let table = Self { limits };
        info!("{} thresholds carregados: {:?}", table.len(), table.limits);
        table
    }

    /// Limite de uma métrica, se configurado.
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.limits.get(metric).copied()
    }

    /// Itera em ordem alfabética de métrica.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.limits.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

/// Interpreta o valor de uma chave de threshold.
///
/// Aceita número TOML ou string numérica; string vazia → `None`.
fn parse_limit(key: &str, raw: &toml::Value) -> Result<Option<f64>, ConfigError> {
    let invalid = || ConfigError::InvalidThreshold {
        key: key.to_string(),
        value: raw.to_string(),
    };

    let limit = match raw {
        toml::Value::Integer(i) => *i as f64,
        toml::Value::Float(f) => *f,
        toml::Value::String(s) if s.trim().is_empty() => return Ok(None),
        toml::Value::String(s) => s.trim().parse::<f64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };

    if !limit.is_finite() {
        return Err(invalid());
    }
    Ok(Some(limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config(toml_src: &str) -> ServerConfig {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn loads_numbers_and_numeric_strings() {
        let cfg = server_config(
            r#"
threshold_temperature = 40
threshold_humidity = "75.5"
threshold_smoke = 1000.0
"#,
        );
        let table = ThresholdTable::from_config(&cfg);
        assert_eq!(table.len(), 3);
        assert_eq!(table.get("temperature"), Some(40.0));
        assert_eq!(table.get("humidity"), Some(75.5));
        assert_eq!(table.get("smoke"), Some(1000.0));
    }

    #[test]
    fn empty_value_disables_metric() {
        let cfg = server_config(
            r#"
threshold_temperature = 40
threshold_noise = ""
"#,
        );
        let table = ThresholdTable::from_config(&cfg);
        assert_eq!(table.get("noise"), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unparseable_value_is_skipped() {
        let cfg = server_config(
            r#"
threshold_temperature = "quente"
threshold_smoke = true
threshold_noise = 90
"#,
        );
        let table = ThresholdTable::from_config(&cfg);
        assert_eq!(table.get("temperature"), None);
        assert_eq!(table.get("smoke"), None);
        assert_eq!(table.get("noise"), Some(90.0));
    }

    #[test]
    fn default_config_has_no_thresholds() {
        let table = ThresholdTable::from_config(&ServerConfig::default());
        assert!(table.is_empty());
    }

    #[test]
    fn iteration_is_sorted() {
        let table = ThresholdTable::from_entries([("smoke", 900.0), ("humidity", 70.0)]);
        let metrics: Vec<_> = table.iter().map(|(m, _)| m).collect();
        assert_eq!(metrics, vec!["humidity", "smoke"]);
    }

    #[test]
    fn parse_limit_rejects_nan() {
        assert!(parse_limit("threshold_x", &toml::Value::Float(f64::NAN)).is_err());
        assert!(matches!(
            parse_limit("threshold_x", &toml::Value::String("abc".into())),
            Err(ConfigError::InvalidThreshold { .. })
        ));
    }
}
