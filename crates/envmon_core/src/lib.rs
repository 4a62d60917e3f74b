//! # Environment Monitor Core
//!
//! Crate compartilhada entre o servidor de ingestão e o sensor. Define o
//! protocolo texto, a configuração TOML, a tabela de thresholds, o motor de
//! alarmes com debounce por cliente e a camada de storage.
//!
//! ## Módulos
//! - [`types`] – Leituras, linhas de tabela e payload do sensor
//! - [`protocol`] – Decoder de pares `"chave": valor` e tokens de resposta
//! - [`config`] – Configuração unificada via TOML
//! - [`thresholds`] – Limites por métrica, congelados após o startup
//! - [`alarm`] – Motor de alarmes com trava e extensão
//! - [`storage`] – Persistência (memória e JSON Lines)

pub mod types;
pub mod protocol;
pub mod config;
pub mod thresholds;
pub mod alarm;
pub mod storage;

// Re-exports convenientes
pub use types::{Reading, Row, SensorPayload, Verdict};
pub use protocol::{Decoder, Reply, MAX_MESSAGE_SIZE};
pub use config::{AppConfig, SensorConfig, ServerConfig};
pub use thresholds::ThresholdTable;
pub use alarm::{AlarmEngine, EvaluationError};
pub use storage::{JsonlStore, MemoryStore, Storage, StorageError};
