//! Definição de tipos compartilhados entre servidor, sensor e motor de alarmes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coluna que identifica o cliente (endereço de origem da conexão).
pub const CLIENT_ID_FIELD: &str = "clientIP";

/// Coluna com o instante de inserção, preenchida pela camada de storage.
pub const INSERT_TIME_FIELD: &str = "etime";

/// Marcador substituído pelo timestamp no momento da inserção.
pub const NOW_MARKER: &str = "NOW()";

/// Uma linha de tabela: coluna → valor textual.
pub type Row = BTreeMap<String, String>;

// ──────────────────────────────────────────────
// Leitura
// ──────────────────────────────────────────────

/// Uma leitura decodificada, associada ao cliente que a enviou.
///
/// Os valores ficam como texto; a conversão numérica acontece no motor de
/// alarmes, que decide o que fazer com campos inválidos.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    pub client_id: String,
    pub fields: BTreeMap<String, String>,
}

impl Reading {
    pub fn new(client_id: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            client_id: client_id.into(),
            fields,
        }
    }

    /// Valor textual de um campo, se presente.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Monta a linha para persistência.
    ///
    /// O `clientIP` vem sempre da conexão, mesmo que o payload traga um campo
    /// homônimo, e `etime` leva o marcador de inserção.
    pub fn to_row(&self) -> Row {
        let mut row = self.fields.clone();
        row.insert(CLIENT_ID_FIELD.into(), self.client_id.clone());
        row.insert(INSERT_TIME_FIELD.into(), NOW_MARKER.into());
        row
    }
}

// ──────────────────────────────────────────────
// Veredito
// ──────────────────────────────────────────────

/// Resultado de uma avaliação bem sucedida do motor de alarmes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nenhuma métrica violada e o cliente não está em alarme.
    Ack,
    /// Alarme ativo (violação atual ou trava ainda vigente).
    AlarmActive,
}

// ──────────────────────────────────────────────
// Payload do sensor
// ──────────────────────────────────────────────

/// Amostra enviada pelo sensor, serializada como JSON.
///
/// Os nomes dos campos seguem o sufixo padrão `Val` da configuração
/// (`temperatureVal`, `humidityVal`, …).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorPayload {
    /// Temperatura ambiente (°C)
    pub temperature_val: f64,
    /// Umidade relativa (%)
    pub humidity_val: f64,
    /// Concentração de fumaça (ppm)
    pub smoke_val: f64,
    /// Nível de ruído (dB)
    pub noise_val: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_carries_client_and_insert_marker() {
        let mut fields = BTreeMap::new();
        fields.insert("temperatureVal".to_string(), "21.5".to_string());
        fields.insert(CLIENT_ID_FIELD.to_string(), "1".to_string());

        let row = Reading::new("10.0.0.5", fields).to_row();
        assert_eq!(row["clientIP"], "10.0.0.5");
        assert_eq!(row["etime"], NOW_MARKER);
        assert_eq!(row["temperatureVal"], "21.5");
    }

    #[test]
    fn sensor_payload_uses_suffixed_field_names() {
        let payload = SensorPayload {
            temperature_val: 42.0,
            humidity_val: 50.0,
            smoke_val: 800.0,
            noise_val: 35.0,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"temperatureVal\":42.0"));
        assert!(json.contains("\"noiseVal\":35.0"));
    }
}
