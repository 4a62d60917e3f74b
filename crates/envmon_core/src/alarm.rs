//! Motor de alarmes com debounce por cliente.
//!
//! Cada cliente (endereço de origem) ganha um estado de alarme na primeira
//! violação. Ao entrar em alarme, uma thread de trava mantém o alarme ativo
//! por `lock_duration`; uma nova violação durante a trava só pede a extensão
//! do prazo, nunca cria uma segunda thread.
//!
//! ```text
//!             violação                       violação (reset_requested)
//!   inativo ───────────▶ ativo ◀────────────────────────┐
//!      ▲                  │  └──────────────────────────┘
//!      └──────────────────┘
//!        prazo expirou sem reset pendente
//! ```
//!
//! Todo o estado mutável fica atrás de um único `Mutex`; cada thread de trava
//! dorme no `Condvar` do seu cliente até o prazo ou até um reset daquele
//! cliente acordá-la.

use crate::config::{MAX_LOCK_DURATION_SECS, ServerConfig};
use crate::thresholds::ThresholdTable;
use crate::types::{Reading, Verdict};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Erros de avaliação de uma leitura.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Campo `{field}` ausente na leitura de [{client}]")]
    MissingField { client: String, field: String },

    #[error("Campo `{field}` de [{client}] não é numérico: {value:?}")]
    NotNumeric {
        client: String,
        field: String,
        value: String,
    },

    #[error("Falha ao iniciar a trava de alarme de [{client}]: {source}")]
    TimerSpawn {
        client: String,
        #[source]
        source: std::io::Error,
    },
}

// ──────────────────────────────────────────────
// Estado por cliente
// ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct ClientAlarm {
    active: bool,
    lock_deadline: Option<Instant>,
    reset_requested: bool,
    last_violations: BTreeMap<String, f64>,
    message: Option<String>,
    /// Acorda a thread de trava deste cliente.
    wake: Arc<Condvar>,
}

/// Cópia do estado de alarme de um cliente.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientAlarmSnapshot {
    pub active: bool,
    pub lock_deadline: Option<Instant>,
    pub reset_requested: bool,
    pub last_violations: BTreeMap<String, f64>,
    pub message: Option<String>,
}

impl From<&ClientAlarm> for ClientAlarmSnapshot {
    fn from(state: &ClientAlarm) -> Self {
        Self {
            active: state.active,
            lock_deadline: state.lock_deadline,
            reset_requested: state.reset_requested,
            last_violations: state.last_violations.clone(),
            message: state.message.clone(),
        }
    }
}

struct Shared {
    clients: Mutex<HashMap<String, ClientAlarm>>,
    live_timers: AtomicUsize,
}

/// `now + lock`, saturando no teto de trava em vez de estourar o `Instant`.
fn deadline_after(now: Instant, lock: Duration) -> Instant {
    now.checked_add(lock)
        .or_else(|| now.checked_add(Duration::from_secs(MAX_LOCK_DURATION_SECS)))
        .unwrap_or(now)
}

// ──────────────────────────────────────────────
// Motor
// ──────────────────────────────────────────────

/// Avalia leituras contra a [`ThresholdTable`] e mantém a trava de alarme.
///
/// Construído uma vez no startup e compartilhado via `Arc` entre as threads
/// de conexão e a API de consulta.
pub struct AlarmEngine {
    thresholds: Arc<ThresholdTable>,
    suffix: String,
    lock_duration: Duration,
    shared: Arc<Shared>,
}

impl AlarmEngine {
    /// `lock_duration` acima de [`MAX_LOCK_DURATION_SECS`] é reduzida ao teto.
    pub fn new(thresholds: Arc<ThresholdTable>, suffix: impl Into<String>, lock_duration: Duration) -> Self {
        let max_lock = Duration::from_secs(MAX_LOCK_DURATION_SECS);
        if lock_duration > max_lock {
            warn!(
                "Trava de {}s acima do teto, usando {MAX_LOCK_DURATION_SECS}s",
                lock_duration.as_secs()
            );
        }

        Self {
            thresholds,
            suffix: suffix.into(),
            lock_duration: lock_duration.min(max_lock),
            shared: Arc::new(Shared {
                clients: Mutex::new(HashMap::new()),
                live_timers: AtomicUsize::new(0),
            }),
        }
    }

    pub fn from_config(config: &ServerConfig, thresholds: Arc<ThresholdTable>) -> Self {
        Self::new(
            thresholds,
            config.suffix_of_collected_values.clone(),
            config.lock_duration(),
        )
    }

    /// Avalia uma leitura e atualiza o estado de alarme do cliente.
    ///
    /// Campo ausente ou não numérico retorna erro sem tocar no estado. Quando
    /// o alarme é ativado, `active = true` é gravado na mesma seção crítica
    /// da decisão, então a próxima avaliação do mesmo cliente já o enxerga.
    pub fn evaluate(&self, reading: &Reading) -> Result<Verdict, EvaluationError> {
        let values = self.collect_values(reading)?;
        let violated = values
            .iter()
            .any(|(metric, value)| self.thresholds.get(metric).is_some_and(|limit| *value >= limit));
        let client = reading.client_id.as_str();

        let mut clients = self.shared.clients.lock();
        let already_active = clients.get(client).is_some_and(|state| state.active);

        if !violated && !already_active {
            if let Some(state) = clients.get_mut(client) {
                state.last_violations.clear();
                state.message = None;
            }
            return Ok(Verdict::Ack);
        }

        let state = clients.entry(client.to_string()).or_default();
        state.last_violations = values;

        if !state.active {
            state.active = true;
            state.reset_requested = false;
            state.lock_deadline = Some(deadline_after(Instant::now(), self.lock_duration));
            if let Err(source) = self.spawn_lock_timer(client, Arc::clone(&state.wake)) {
                state.active = false;
                state.lock_deadline = None;
                state.last_violations.clear();
                return Err(EvaluationError::TimerSpawn {
                    client: client.to_string(),
                    source,
                });
            }
            info!("Alarme ativado em [{client}]");
        } else if violated {
            state.reset_requested = true;
            state.wake.notify_one();
            debug!("Nova violação em [{client}], trava será estendida");
        }

        let message = self.render_message(&state.last_violations);
        state.message = Some(message);
        Ok(Verdict::AlarmActive)
    }

    /// Mensagens de alarme atuais, por cliente.
    pub fn alarm_messages(&self) -> BTreeMap<String, String> {
        self.shared
            .clients
            .lock()
            .iter()
            .filter_map(|(client, state)| state.message.clone().map(|m| (client.clone(), m)))
            .collect()
    }

    /// Cópia do estado de um cliente, se ele já entrou em alarme alguma vez.
    pub fn client_state(&self, client: &str) -> Option<ClientAlarmSnapshot> {
        self.shared.clients.lock().get(client).map(ClientAlarmSnapshot::from)
    }

    pub fn is_active(&self, client: &str) -> bool {
        self.shared
            .clients
            .lock()
            .get(client)
            .is_some_and(|state| state.active)
    }

    /// Número de threads de trava vivas.
    pub fn live_timers(&self) -> usize {
        self.shared.live_timers.load(Ordering::Acquire)
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    // ──────────────────────────────────────────
    // Internos
    // ──────────────────────────────────────────

    /// Valor de cada métrica da tabela de thresholds presente na leitura.
    fn collect_values(&self, reading: &Reading) -> Result<BTreeMap<String, f64>, EvaluationError> {
        let mut values = BTreeMap::new();

        for (metric, _) in self.thresholds.iter() {
            let field = format!("{metric}{}", self.suffix);
            let raw = reading
                .field(&field)
                .ok_or_else(|| EvaluationError::MissingField {
                    client: reading.client_id.clone(),
                    field: field.clone(),
                })?;
            let value = raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| EvaluationError::NotNumeric {
                    client: reading.client_id.clone(),
                    field: field.clone(),
                    value: raw.to_string(),
                })?;
            values.insert(metric.to_string(), value);
        }

        Ok(values)
    }

    fn render_message(&self, values: &BTreeMap<String, f64>) -> String {
        let mut lines: Vec<String> = values
            .iter()
            .filter_map(|(metric, value)| {
                let limit = self.thresholds.get(metric)?;
                (*value >= limit).then(|| format!("{metric} is at {value}, should be under {limit}."))
            })
            .collect();

        if lines.is_empty() {
            lines.push(format!(
                "No collected data exceeds the threshold, but the alarm lock needs to ensure at least {} seconds of alarm time.",
                self.lock_duration.as_secs_f64()
            ));
        }

        lines.join("\n")
    }

    fn spawn_lock_timer(&self, client: &str, wake: Arc<Condvar>) -> std::io::Result<()> {
        let shared = Arc::clone(&self.shared);
        let client_id = client.to_string();
        let lock_duration = self.lock_duration;

        self.shared.live_timers.fetch_add(1, Ordering::AcqRel);
        let spawned = std::thread::Builder::new()
            .name(format!("alarm-lock-{client}"))
            .spawn(move || {
                run_lock_timer(&shared, &wake, &client_id, lock_duration);
                shared.live_timers.fetch_sub(1, Ordering::AcqRel);
            });

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                self.shared.live_timers.fetch_sub(1, Ordering::AcqRel);
                error!("Não foi possível criar a thread de trava para [{client}]: {e}");
                Err(e)
            }
        }
    }
}

/// Corpo da thread de trava de um cliente.
///
/// Dorme até o prazo; um reset pendente reinicia a contagem a partir de
/// agora. Quando o prazo vence sem reset, desativa o alarme e sai.
fn run_lock_timer(shared: &Shared, wake: &Condvar, client: &str, lock_duration: Duration) {
    let mut clients = shared.clients.lock();

    loop {
        let Some(state) = clients.get_mut(client) else {
            return;
        };

        let now = Instant::now();
        if state.reset_requested {
            state.reset_requested = false;
            state.lock_deadline = Some(deadline_after(now, lock_duration));
        }

        let deadline = state.lock_deadline.unwrap_or(now);
        if now >= deadline {
            state.active = false;
            state.lock_deadline = None;
            state.last_violations.clear();
            state.message = None;
            info!("Alarme liberado em [{client}]");
            return;
        }

        wake.wait_until(&mut clients, deadline);
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
