//! Dispatcher TCP – uma thread por conexão de sensor.
//!
//! Cada `read` na conexão é uma mensagem: o payload é decodificado, marcado
//! com o IP do cliente, entregue à persistência e avaliado pelo motor de
//! alarmes. O token de resposta volta na mesma conexão.
//!
//! Thread-por-conexão é o teto de escala deste servidor; com muitos sensores
//! simultâneos um reactor assíncrono poderia substituir este módulo sem
//! mudar o contrato do [`AlarmEngine`].

use crate::persist::PersistHandle;
use envmon_core::alarm::AlarmEngine;
use envmon_core::protocol::{Decoder, MAX_MESSAGE_SIZE, Reply, escape_for_log};
use envmon_core::types::Reading;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Estado compartilhado por todas as threads de conexão.
pub struct ConnectionContext {
    decoder: Decoder,
    engine: Arc<AlarmEngine>,
    persist: PersistHandle,
    known_clients: Mutex<BTreeSet<String>>,
    log_operations: bool,
}

impl ConnectionContext {
    pub fn new(engine: Arc<AlarmEngine>, persist: PersistHandle, log_operations: bool) -> Self {
        Self {
            decoder: Decoder::new(),
            engine,
            persist,
            known_clients: Mutex::new(BTreeSet::new()),
            log_operations,
        }
    }

    /// Pré-carrega clientes já vistos (ex.: valores distintos do storage).
    pub fn with_known_clients(self, clients: impl IntoIterator<Item = String>) -> Self {
        self.known_clients.lock().extend(clients);
        self
    }

    #[cfg(test)]
    pub fn known_clients(&self) -> Vec<String> {
        self.known_clients.lock().iter().cloned().collect()
    }

    /// Processa uma mensagem de um cliente e devolve a resposta.
    ///
    /// Payload sem nenhum par utilizável é respondido com `error` sem passar
    /// pela persistência nem pelo motor de alarmes.
    pub fn process(&self, client_ip: &str, message: &str) -> Reply {
        let reading = match self.decoder.decode_strict(message) {
            Ok(fields) => Reading::new(client_ip, fields),
            Err(e) => {
                warn!("[{client_ip}] {e}");
                return Reply::Error;
            }
        };
        self.persist.submit(reading.to_row());

        match self.engine.evaluate(&reading) {
            Ok(verdict) => Reply::from(verdict),
            Err(e) => {
                warn!("[{client_ip}] {e}");
                Reply::Error
            }
        }
    }

    fn register_client(&self, client_ip: &str) {
        if self.known_clients.lock().insert(client_ip.to_string()) {
            info!("[{client_ip}] Novo cliente");
        }
    }
}

// ──────────────────────────────────────────────
// Listener
// ──────────────────────────────────────────────

/// Listener TCP de ingestão.
pub struct Dispatcher {
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
}

impl Dispatcher {
    /// Abre o socket de escuta. Falha aqui aborta a ingestão.
    pub fn bind(addr: impl ToSocketAddrs, ctx: ConnectionContext) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> Arc<ConnectionContext> {
        Arc::clone(&self.ctx)
    }

    /// Aceita conexões indefinidamente, uma thread por conexão.
    pub fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Aguardando conexões em {addr}"),
            Err(e) => warn!("Endereço local indisponível: {e}"),
        }

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let ctx = Arc::clone(&self.ctx);
                    let spawned = std::thread::Builder::new()
                        .name("tcp-client".into())
                        .spawn(move || handle_client(&ctx, stream));
                    if let Err(e) = spawned {
                        error!("Falha ao criar thread de conexão: {e}");
                    }
                }
                Err(e) => warn!("Falha ao aceitar conexão: {e}"),
            }
        }
    }

    /// Executa [`Dispatcher::run`] numa thread própria.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("tcp-listener".into())
            .spawn(move || self.run())
    }
}

/// Loop de uma conexão: termina quando o cliente fecha ou há erro de E/S.
fn handle_client(ctx: &ConnectionContext, mut stream: TcpStream) {
    let client_ip = match stream.peer_addr() {
        Ok(addr) => addr.ip().to_string(),
        Err(e) => {
            warn!("Conexão sem endereço de origem: {e}");
            return;
        }
    };
    info!("[{client_ip}] Conexão aceita");
    ctx.register_client(&client_ip);
    stream.set_nodelay(true).ok();

    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("[{client_ip}] Cliente desconectado");
                break;
            }
            Ok(size) => {
                let message = String::from_utf8_lossy(&buf[..size]);
                if ctx.log_operations {
                    info!("[{client_ip}] Mensagem recebida: \"{}\"", escape_for_log(&message));
                }

                let reply = ctx.process(&client_ip, &message);
                if let Err(e) = stream.write_all(reply.as_str().as_bytes()) {
                    warn!("[{client_ip}] Falha ao enviar resposta: {e}");
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("[{client_ip}] Falha na leitura: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::spawn_writer;
    use envmon_core::storage::{MemoryStore, Storage};
    use envmon_core::thresholds::ThresholdTable;
    use envmon_core::types::CLIENT_ID_FIELD;
    use std::time::{Duration, Instant};

    struct Harness {
        addr: SocketAddr,
        ctx: Arc<ConnectionContext>,
        engine: Arc<AlarmEngine>,
        store: Arc<MemoryStore>,
    }

    fn start(lock: Duration) -> Harness {
        let thresholds = Arc::new(ThresholdTable::from_entries([("temperature", 40.0)]));
        let engine = Arc::new(AlarmEngine::new(thresholds, "Val", lock));
        let store = Arc::new(MemoryStore::new());
        let (persist, _writer) = spawn_writer(store.clone(), "envtable".into(), 64).unwrap();

        let ctx = ConnectionContext::new(engine.clone(), persist, true);
        let dispatcher = Dispatcher::bind("127.0.0.1:0", ctx).unwrap();
        let addr = dispatcher.local_addr().unwrap();
        let ctx = dispatcher.context();
        dispatcher.spawn().unwrap();

        Harness { addr, ctx, engine, store }
    }

    fn exchange(stream: &mut TcpStream, payload: &str) -> String {
        stream.write_all(payload.as_bytes()).unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn replies_follow_alarm_state() {
        let h = start(Duration::from_millis(300));
        let mut stream = connect(h.addr);

        assert_eq!(exchange(&mut stream, r#"{"temperatureVal": 21.0}"#), "ack");
        assert_eq!(exchange(&mut stream, r#"{"temperatureVal": 42.0, "humidityVal": 50.0}"#), "alarm_active");
        assert!(h.engine.is_active("127.0.0.1"));
        assert_eq!(exchange(&mut stream, r#"{"temperatureVal": 38.0}"#), "alarm_active");

        assert!(wait_until(Duration::from_secs(2), || !h.engine.is_active("127.0.0.1")));
        assert_eq!(exchange(&mut stream, r#"{"temperatureVal": 38.0}"#), "ack");
    }

    #[test]
    fn missing_metric_replies_error_and_keeps_connection() {
        let h = start(Duration::from_millis(300));
        let mut stream = connect(h.addr);

        assert_eq!(exchange(&mut stream, r#"{"humidityVal": 50.0}"#), "error");
        assert_eq!(exchange(&mut stream, "lixo sem pares"), "error");
        assert_eq!(exchange(&mut stream, r#"{"temperatureVal": 10}"#), "ack");
    }

    #[test]
    fn readings_are_persisted_with_client_ip() {
        let h = start(Duration::from_millis(300));
        let mut stream = connect(h.addr);
        exchange(&mut stream, r#"{"temperatureVal": 22.5}"#);

        assert!(wait_until(Duration::from_secs(2), || h.store.len("envtable") == 1));
        let row = h
            .store
            .read_latest_by_client("envtable", "127.0.0.1")
            .unwrap()
            .unwrap();
        assert_eq!(row["temperatureVal"], "22.5");
        assert_eq!(row[CLIENT_ID_FIELD], "127.0.0.1");
    }

    #[test]
    fn one_client_closing_does_not_affect_others() {
        let h = start(Duration::from_millis(300));
        let mut first = connect(h.addr);
        let mut second = connect(h.addr);

        assert_eq!(exchange(&mut first, r#"{"temperatureVal": 1}"#), "ack");
        drop(first);
        assert_eq!(exchange(&mut second, r#"{"temperatureVal": 2}"#), "ack");
        assert_eq!(h.ctx.known_clients(), vec!["127.0.0.1".to_string()]);
    }

    #[test]
    fn process_without_thresholds_acks_everything() {
        let engine = Arc::new(AlarmEngine::new(
            Arc::new(ThresholdTable::default()),
            "Val",
            Duration::from_secs(1),
        ));
        let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let (persist, _writer) = spawn_writer(store, "envtable".into(), 4).unwrap();
        let ctx = ConnectionContext::new(engine, persist, false)
            .with_known_clients(["10.0.0.1".to_string()]);

        assert_eq!(ctx.process("10.0.0.2", r#"{"humidityVal": 50}"#), Reply::Ack);
        assert_eq!(ctx.known_clients(), vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn payload_without_pairs_is_an_error_even_without_thresholds() {
        let engine = Arc::new(AlarmEngine::new(
            Arc::new(ThresholdTable::default()),
            "Val",
            Duration::from_secs(1),
        ));
        let store = Arc::new(MemoryStore::new());
        let (persist, writer) = spawn_writer(store.clone(), "envtable".into(), 4).unwrap();
        let ctx = ConnectionContext::new(engine, persist, false);

        assert_eq!(ctx.process("10.0.0.2", "{}"), Reply::Error);
        assert_eq!(ctx.process("10.0.0.2", "lixo"), Reply::Error);

        drop(ctx);
        writer.join().unwrap();
        assert_eq!(store.len("envtable"), 0);
    }
}
