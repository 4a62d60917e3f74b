//! Protocolo texto entre sensor e servidor.
//!
//! Não há framing explícito: cada `read` no socket é tratado como uma
//! mensagem completa.
//!
//! ```text
//! sensor → servidor   {"temperatureVal": 42.5, "humidityVal": 50}
//! servidor → sensor   ack | alarm_active | error
//! ```
//!
//! O decoder apenas procura pares `"chave": número`; o resto do payload é
//! ignorado, então payloads truncados ou malformados nunca são fatais.

use crate::types::Verdict;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

/// Tamanho máximo lido por mensagem.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Erros de decodificação.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Nenhum par chave/valor encontrado ({0} bytes)")]
    NoFields(usize),
}

// ──────────────────────────────────────────────
// Decoder
// ──────────────────────────────────────────────

/// Extrai pares `"chave": número` de um payload texto.
///
/// Aceita aspas simples ou duplas, opcionalmente escapadas (`\"chave\"`),
/// como enviam clientes que mandam JSON já escapado. O número pode ter
/// expoente (`1.5e3`) e precisa terminar em espaço, `,`, `}`, `]` ou no fim
/// do payload; um valor colado em outro texto é ignorado, nunca truncado.
#[derive(Debug, Clone)]
pub struct Decoder {
    pattern: Regex,
}

impl Decoder {
    pub fn new() -> Self {
        let pattern = Regex::new(r#"\\?["'](\w+)\\?["']\s*:\s*(-?\d+(?:\.\d*)?(?:[eE][+-]?\d+)?)(?:[\s,}\]]|$)"#)
            .expect("regex do decoder é válida");
        Self { pattern }
    }

    /// Decodifica de forma tolerante. Sem correspondências → mapa vazio.
    ///
    /// Chaves repetidas ficam com o último valor.
    pub fn decode(&self, payload: &str) -> BTreeMap<String, String> {
        self.pattern
            .captures_iter(payload)
            .map(|caps| (caps[1].to_string(), caps[2].to_string()))
            .collect()
    }

    /// Igual a [`Decoder::decode`], mas reporta payload sem pares.
    pub fn decode_strict(&self, payload: &str) -> Result<BTreeMap<String, String>, DecodeError> {
        let fields = self.decode(payload);
        if fields.is_empty() {
            return Err(DecodeError::NoFields(payload.len()));
        }
        Ok(fields)
    }

}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────────────────────────────────
// Resposta
// ──────────────────────────────────────────────

/// Token de resposta escrito de volta na conexão.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    AlarmActive,
    Error,
}

impl Reply {
    pub fn as_str(self) -> &'static str {
        match self {
            Reply::Ack => "ack",
            Reply::AlarmActive => "alarm_active",
            Reply::Error => "error",
        }
    }

    /// Interpreta um token recebido (espaços nas pontas são ignorados).
    pub fn parse(token: &str) -> Option<Reply> {
        match token.trim() {
            "ack" => Some(Reply::Ack),
            "alarm_active" => Some(Reply::AlarmActive),
            "error" => Some(Reply::Error),
            _ => None,
        }
    }
}

impl From<Verdict> for Reply {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Ack => Reply::Ack,
            Verdict::AlarmActive => Reply::AlarmActive,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escapa caracteres de controle para registrar a mensagem em uma linha.
pub fn escape_for_log(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for c in message.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
    out
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
