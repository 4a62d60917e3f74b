//! Thread de persistência – grava as linhas recebidas sem bloquear as
//! threads de conexão.
//!
//! As conexões entregam cada linha num channel limitado; se o channel
//! estiver cheio, a linha é descartada com aviso e a avaliação do alarme
//! segue normalmente.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use envmon_core::storage::Storage;
use envmon_core::types::Row;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacidade padrão do channel de persistência.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Ponta de envio, clonável entre as threads de conexão.
#[derive(Debug, Clone)]
pub struct PersistHandle {
    tx: Sender<Row>,
}

impl PersistHandle {
    /// Entrega uma linha ao writer. Retorna `false` se ela foi descartada.
    pub fn submit(&self, row: Row) -> bool {
        match self.tx.try_send(row) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Fila de persistência cheia, descartando leitura");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("Writer de persistência encerrado, descartando leitura");
                false
            }
        }
    }
}

/// Inicia a thread de persistência para a tabela `table`.
///
/// A thread termina quando todos os [`PersistHandle`] forem descartados.
pub fn spawn_writer(
    storage: Arc<dyn Storage>,
    table: String,
    capacity: usize,
) -> std::io::Result<(PersistHandle, JoinHandle<()>)> {
    let (tx, rx) = bounded::<Row>(capacity);

    let handle = std::thread::Builder::new()
        .name("persist-writer".into())
        .spawn(move || writer_loop(storage.as_ref(), &table, &rx))?;

    Ok((PersistHandle { tx }, handle))
}

fn writer_loop(storage: &dyn Storage, table: &str, rx: &Receiver<Row>) {
    info!("Writer de persistência ativo (tabela {table})");

    for row in rx.iter() {
        match storage.insert(table, &row) {
            Ok(()) => debug!("Linha gravada em {table}"),
            Err(e) => error!("Falha ao gravar leitura em {table}: {e}"),
        }
    }

    info!("Writer de persistência encerrado");
}

#[cfg(test)]
mod tests {
    use super::*;
    use envmon_core::storage::MemoryStore;
    use envmon_core::types::CLIENT_ID_FIELD;

    fn row(client: &str) -> Row {
        let mut row = Row::new();
        row.insert(CLIENT_ID_FIELD.into(), client.into());
        row.insert("temperatureVal".into(), "20".into());
        row
    }

    #[test]
    fn rows_reach_storage() {
        let store = Arc::new(MemoryStore::new());
        let (handle, writer) = spawn_writer(store.clone(), "envtable".into(), 8).unwrap();

        assert!(handle.submit(row("10.0.0.1")));
        assert!(handle.submit(row("10.0.0.2")));
        drop(handle);
        writer.join().unwrap();

        assert_eq!(store.len("envtable"), 2);
    }

    #[test]
    fn storage_errors_do_not_stop_the_writer() {
        let store = Arc::new(MemoryStore::new());
        let (handle, writer) = spawn_writer(store.clone(), "envtable".into(), 8).unwrap();

        assert!(handle.submit(Row::new()));
        assert!(handle.submit(row("10.0.0.1")));
        drop(handle);
        writer.join().unwrap();

        assert_eq!(store.len("envtable"), 1);
    }

    #[test]
    fn submit_after_writer_exit_is_rejected() {
        let (tx, rx) = bounded::<Row>(1);
        drop(rx);
        let handle = PersistHandle { tx };
        assert!(!handle.submit(row("x")));
    }
}
