//! Configuração unificada via TOML.
//!
//! O arquivo tem duas seções, `[server]` e `[sensor]`. As chaves de threshold
//! são dinâmicas (`threshold_temperature`, `threshold_smoke`, …) e ficam no
//! mapa `extra` da seção `[server]`; quem as interpreta é
//! [`ThresholdTable::from_config`](crate::thresholds::ThresholdTable::from_config).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Variável de ambiente que sobrescreve o caminho do arquivo de configuração.
pub const CONFIG_PATH_ENV: &str = "ENVMON_CONFIG";

/// Teto da trava de alarme (um ano).
pub const MAX_LOCK_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Erros de configuração.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Threshold inválido em `{key}`: {value}")]
    InvalidThreshold { key: String, value: String },

    #[error("Erro ao ler {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Erro ao parsear {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Erro ao serializar configuração: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Erro ao gravar {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuração do servidor de ingestão.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP de bind do servidor TCP
    pub tcp_server_ip: String,
    /// Porta TCP de ingestão
    pub tcp_server_port: u16,
    /// Liga/desliga a API HTTP de consulta
    pub http_enabled: bool,
    /// IP de bind da API HTTP
    pub http_host: String,
    /// Porta da API HTTP
    pub http_port: u16,
    /// Diretório estático servido em `/` (frontend web); ignorado se não existir
    pub http_mount_dir: PathBuf,
    /// Diretório das tabelas JSON Lines
    pub data_dir: PathBuf,
    /// Tabela onde as leituras são gravadas
    pub table_name: String,
    /// Sufixo dos campos coletados (`temperature` + `Val`)
    pub suffix_of_collected_values: String,
    /// Prefixo das chaves de threshold
    pub prefix_of_threshold_value: String,
    /// Duração mínima do alarme após a última violação (segundos)
    pub alarm_lock_duration_seconds: u64,
    /// Registra cada mensagem recebida e cada requisição HTTP
    pub log_operations: bool,
    /// Chaves restantes, entre elas os thresholds (`threshold_<métrica>`)
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut extra = BTreeMap::new();
        for metric in ["temperature", "humidity", "smoke"] {
            extra.insert(format!("threshold_{metric}"), toml::Value::String(String::new()));
        }

        Self {
            tcp_server_ip: "0.0.0.0".into(),
            tcp_server_port: 8080,
            http_enabled: true,
            http_host: "127.0.0.1".into(),
            http_port: 5050,
            http_mount_dir: PathBuf::from("./dist"),
            data_dir: PathBuf::from("./data"),
            table_name: "envtable".into(),
            suffix_of_collected_values: "Val".into(),
            prefix_of_threshold_value: "threshold_".into(),
            alarm_lock_duration_seconds: 60,
            log_operations: false,
            extra,
        }
    }
}

impl ServerConfig {
    /// Endereço `ip:porta` do servidor TCP.
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.tcp_server_ip, self.tcp_server_port)
    }

    /// Endereço `ip:porta` da API HTTP.
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Duração da trava, limitada a [`MAX_LOCK_DURATION_SECS`].
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.alarm_lock_duration_seconds.min(MAX_LOCK_DURATION_SECS))
    }

    /// Pares `(métrica, valor bruto)` das chaves com o prefixo de threshold.
    pub fn threshold_entries(&self) -> impl Iterator<Item = (&str, &toml::Value)> {
        let prefix = self.prefix_of_threshold_value.as_str();
        self.extra
            .iter()
            .filter_map(move |(key, value)| key.strip_prefix(prefix).map(|metric| (metric, value)))
    }
}

/// Configuração do sensor (cliente de telemetria).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// IP do servidor de ingestão
    pub server_ip: String,
    /// Porta TCP do servidor
    pub server_port: u16,
    /// Intervalo de envio em segundos
    pub interval_secs: f64,
    /// Usa os sensores térmicos da máquina para a temperatura
    pub use_host_temperature: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            server_ip: "127.0.0.1".into(),
            server_port: 8080,
            interval_secs: 1.0,
            use_host_temperature: true,
        }
    }
}

impl SensorConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_ip, self.server_port)
    }
}

/// Configuração raiz do aplicativo (unifica servidor e sensor).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sensor: SensorConfig,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML.
    ///
    /// Arquivo ausente ou inválido nunca aborta o startup: registra o motivo
    /// e usa a configuração padrão.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match Self::try_load(path) {
                Ok(config) => {
                    info!("Configuração carregada de {}", path.display());
                    return config;
                }
                Err(e) => warn!("{e}"),
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    /// Carrega configuração, propagando o erro.
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Salva configuração em arquivo TOML, criando o diretório se preciso.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        let write_err = |source: std::io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(write_err)?;
        }
        std::fs::write(path, content).map_err(write_err)?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho do config.toml.
    ///
    /// `ENVMON_CONFIG` tem precedência; senão, `configs/envmon.toml` ao lado
    /// do executável.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("configs").join("envmon.toml")
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server.tcp_server_port == 0 {
            errors.push("Porta TCP do servidor não pode ser 0".into());
        }
        if self.server.http_enabled && self.server.http_port == 0 {
            errors.push("Porta HTTP não pode ser 0".into());
        }
        if self.server.alarm_lock_duration_seconds == 0 {
            errors.push("alarm_lock_duration_seconds deve ser maior que 0".into());
        }
        if self.server.alarm_lock_duration_seconds > MAX_LOCK_DURATION_SECS {
            errors.push(format!(
                "alarm_lock_duration_seconds acima do teto: {} (máx. {MAX_LOCK_DURATION_SECS})",
                self.server.alarm_lock_duration_seconds
            ));
        }
        if self.server.prefix_of_threshold_value.is_empty() {
            errors.push("prefix_of_threshold_value não pode ser vazio".into());
        }
        if self.server.table_name.is_empty() {
            errors.push("table_name não pode ser vazio".into());
        }
        if self.sensor.interval_secs < 0.1 || self.sensor.interval_secs > 3600.0 {
            errors.push(format!(
                "Intervalo do sensor inválido: {} (0.1–3600.0)",
                self.sensor.interval_secs
            ));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        let errors = config.validate();
        assert!(errors.is_empty(), "Erros: {:?}", errors);
    }

    #[test]
    fn roundtrip_toml_keeps_threshold_keys() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("threshold_temperature"));
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.server.tcp_server_port, parsed.server.tcp_server_port);
        assert_eq!(parsed.server.extra.len(), 3);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let partial = r#"
[server]
tcp_server_port = 9999
threshold_temperature = 40
threshold_noise = "85.5"
"#;
        let config: AppConfig = toml::from_str(partial).unwrap();
        assert_eq!(config.server.tcp_server_port, 9999);
        assert_eq!(config.server.alarm_lock_duration_seconds, 60);
        assert_eq!(config.server.suffix_of_collected_values, "Val");
        assert_eq!(config.sensor.server_port, 8080);

        let entries: Vec<_> = config.server.threshold_entries().map(|(m, _)| m).collect();
        assert_eq!(entries, vec!["noise", "temperature"]);
    }

    #[test]
    fn custom_prefix_filters_extra_keys() {
        let config: AppConfig = toml::from_str(
            r#"
[server]
prefix_of_threshold_value = "limit_"
limit_smoke = 900
threshold_temperature = 40
"#,
        )
        .unwrap();
        let entries: Vec<_> = config.server.threshold_entries().map(|(m, _)| m).collect();
        assert_eq!(entries, vec!["smoke"]);
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut config = AppConfig::default();
        config.server.tcp_server_port = 0;
        config.server.alarm_lock_duration_seconds = 0;
        assert_eq!(config.validate().len(), 2);
    }

    #[test]
    fn lock_duration_is_capped() {
        let mut config = AppConfig::default();
        config.server.alarm_lock_duration_seconds = u64::MAX;

        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("alarm_lock_duration_seconds"));
        assert_eq!(
            config.server.lock_duration(),
            Duration::from_secs(MAX_LOCK_DURATION_SECS)
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs").join("envmon.toml");

        let mut config = AppConfig::default();
        config.server.log_operations = true;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path);
        assert!(loaded.server.log_operations);
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envmon.toml");
        std::fs::write(&path, "[server\ntcp_server_port = ").unwrap();

        assert!(matches!(AppConfig::try_load(&path), Err(ConfigError::Parse { .. })));
        assert_eq!(AppConfig::load(&path).server.tcp_server_port, 8080);
    }
}
