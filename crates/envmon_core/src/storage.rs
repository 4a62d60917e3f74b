//! Camada de storage das leituras.
//!
//! O núcleo depende só de três operações ([`Storage`]): inserir uma linha,
//! ler a linha mais recente de um cliente e listar os valores distintos de
//! uma coluna. Há duas implementações:
//!
//! - [`MemoryStore`] – tudo em memória, usado em testes e execuções efêmeras
//! - [`JsonlStore`] – um arquivo `<tabela>.jsonl` por tabela, com índice em
//!   memória da última linha e da ordem de chegada de cada cliente
//!
//! Valores iguais a [`NOW_MARKER`] são trocados pelo horário local da
//! inserção (`%Y-%m-%d %H:%M:%S`).

use crate::types::{CLIENT_ID_FIELD, NOW_MARKER, Row};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Erros de storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Nome de tabela inválido: {0:?}")]
    InvalidTable(String),

    #[error("Linha vazia para a tabela {0}")]
    EmptyRow(String),

    #[error("Erro de E/S em {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Erro de serialização: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Contrato de persistência usado pelo servidor e pela API de consulta.
pub trait Storage: Send + Sync {
    fn insert(&self, table: &str, row: &Row) -> Result<(), StorageError>;

    fn read_latest_by_client(&self, table: &str, client: &str) -> Result<Option<Row>, StorageError>;

    /// Valores distintos de uma coluna, na ordem em que apareceram.
    fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>, StorageError>;
}

/// Tabelas viram nomes de arquivo, então só `[A-Za-z0-9_]` é aceito.
fn validate_table(table: &str) -> Result<(), StorageError> {
    let valid = !table.is_empty() && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidTable(table.to_string()))
    }
}

/// Copia a linha trocando o marcador de inserção pelo horário atual.
fn stamp(row: &Row) -> Row {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    row.iter()
        .map(|(k, v)| {
            let value = if v == NOW_MARKER { now.clone() } else { v.clone() };
            (k.clone(), value)
        })
        .collect()
}

fn push_distinct<'a>(seen: &mut HashSet<&'a str>, out: &mut Vec<String>, value: &'a str) {
    if seen.insert(value) {
        out.push(value.to_string());
    }
}

// ──────────────────────────────────────────────
// Memória
// ──────────────────────────────────────────────

/// Storage volátil em memória.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Row>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Número de linhas de uma tabela.
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, Vec::len)
    }
}

impl Storage for MemoryStore {
    fn insert(&self, table: &str, row: &Row) -> Result<(), StorageError> {
        validate_table(table)?;
        if row.is_empty() {
            return Err(StorageError::EmptyRow(table.to_string()));
        }
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .push(stamp(row));
        Ok(())
    }

    fn read_latest_by_client(&self, table: &str, client: &str) -> Result<Option<Row>, StorageError> {
        validate_table(table)?;
        let tables = self.tables.read();
        let latest = tables.get(table).and_then(|rows| {
            rows.iter()
                .rev()
                .find(|row| row.get(CLIENT_ID_FIELD).is_some_and(|c| c == client))
                .cloned()
        });
        Ok(latest)
    }

    fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>, StorageError> {
        validate_table(table)?;
        let tables = self.tables.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for row in tables.get(table).into_iter().flatten() {
            if let Some(value) = row.get(column) {
                push_distinct(&mut seen, &mut out, value);
            }
        }
        Ok(out)
    }
}

// ──────────────────────────────────────────────
// JSON Lines
// ──────────────────────────────────────────────

/// Tabela aberta: arquivo em modo append + índices por cliente.
///
/// O arquivo só é criado na primeira inserção; consultas a uma tabela
/// inexistente não deixam rastro em disco.
struct JsonlTable {
    path: PathBuf,
    file: Option<File>,
    latest_by_client: HashMap<String, Row>,
    /// Clientes na ordem em que apareceram.
    clients: Vec<String>,
}

impl JsonlTable {
    fn index(&mut self, row: Row) {
        if let Some(client) = row.get(CLIENT_ID_FIELD).cloned() {
            if self.latest_by_client.insert(client.clone(), row).is_none() {
                self.clients.push(client);
            }
        }
    }

    fn append(&mut self, line: &[u8]) -> Result<(), StorageError> {
        let io_err = |source: std::io::Error| StorageError::Io {
            path: self.path.clone(),
            source,
        };
        let file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(io_err)?,
        };
        self.file.insert(file).write_all(line).map_err(io_err)
    }
}

/// Storage em arquivos JSON Lines, um por tabela.
///
/// As tabelas são abertas na primeira utilização; ao abrir, o arquivo
/// existente é lido para reconstruir o índice. Linhas corrompidas são
/// ignoradas com aviso.
pub struct JsonlStore {
    dir: PathBuf,
    tables: Mutex<HashMap<String, JsonlTable>>,
}

impl JsonlStore {
    /// Abre (ou cria) o diretório de dados.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;
        info!("Storage JSON Lines em {}", dir.display());
        Ok(Self {
            dir,
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.jsonl"))
    }

    /// Executa `f` com a tabela aberta, abrindo-a se necessário.
    fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut JsonlTable) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        validate_table(table)?;
        let mut tables = self.tables.lock();
        let t = match tables.entry(table.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.open_table(table)?),
        };
        f(t)
    }

    fn open_table(&self, table: &str) -> Result<JsonlTable, StorageError> {
        let path = self.table_path(table);
        let rows = read_rows(&path)?;

        let mut t = JsonlTable {
            path,
            file: None,
            latest_by_client: HashMap::new(),
            clients: Vec::new(),
        };
        for row in rows {
            t.index(row);
        }

        debug!("Tabela {table} aberta ({} clientes indexados)", t.clients.len());
        Ok(t)
    }
}

/// Lê todas as linhas válidas de um arquivo JSON Lines (ausente → vazio).
fn read_rows(path: &Path) -> Result<Vec<Row>, StorageError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut rows = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Row>(&line) {
            Ok(row) => rows.push(row),
            Err(e) => warn!("{}:{}: linha ignorada ({e})", path.display(), number + 1),
        }
    }
    Ok(rows)
}

impl Storage for JsonlStore {
    fn insert(&self, table: &str, row: &Row) -> Result<(), StorageError> {
        if row.is_empty() {
            return Err(StorageError::EmptyRow(table.to_string()));
        }
        let row = stamp(row);
        let mut line = serde_json::to_vec(&row)?;
        line.push(b'\n');

        self.with_table(table, |t| {
            t.append(&line)?;
            t.index(row);
            Ok(())
        })
    }

    fn read_latest_by_client(&self, table: &str, client: &str) -> Result<Option<Row>, StorageError> {
        self.with_table(table, |t| Ok(t.latest_by_client.get(client).cloned()))
    }

    fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>, StorageError> {
        if column == CLIENT_ID_FIELD {
            return self.with_table(table, |t| Ok(t.clients.clone()));
        }

        validate_table(table)?;
        let rows = read_rows(&self.table_path(table))?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for row in &rows {
            if let Some(value) = row.get(column) {
                push_distinct(&mut seen, &mut out, value);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(client: &str, temperature: &str) -> Row {
        let mut row = Row::new();
        row.insert(CLIENT_ID_FIELD.into(), client.into());
        row.insert("temperatureVal".into(), temperature.into());
        row.insert("etime".into(), NOW_MARKER.into());
        row
    }

    fn exercise(store: &dyn Storage) {
        store.insert("envtable", &row("10.0.0.1", "20")).unwrap();
        store.insert("envtable", &row("10.0.0.2", "30")).unwrap();
        store.insert("envtable", &row("10.0.0.1", "25")).unwrap();

        let latest = store
            .read_latest_by_client("envtable", "10.0.0.1")
            .unwrap()
            .unwrap();
        assert_eq!(latest["temperatureVal"], "25");
        assert_ne!(latest["etime"], NOW_MARKER);

        assert!(store.read_latest_by_client("envtable", "10.9.9.9").unwrap().is_none());
        assert_eq!(
            store.distinct_values("envtable", CLIENT_ID_FIELD).unwrap(),
            vec!["10.0.0.1", "10.0.0.2"]
        );
        assert!(store.distinct_values("other", CLIENT_ID_FIELD).unwrap().is_empty());
    }

    #[test]
    fn memory_store_contract() {
        let store = MemoryStore::new();
        exercise(&store);
        assert_eq!(store.len("envtable"), 3);
    }

    #[test]
    fn jsonl_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        exercise(&store);
        assert!(dir.path().join("envtable.jsonl").exists());
    }

    #[test]
    fn jsonl_store_rebuilds_index_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonlStore::open(dir.path()).unwrap();
            store.insert("envtable", &row("10.0.0.7", "33")).unwrap();
        }
        // Lixo no final do arquivo não impede a leitura.
        let path = dir.path().join("envtable.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{não é json").unwrap();

        let store = JsonlStore::open(dir.path()).unwrap();
        let latest = store.read_latest_by_client("envtable", "10.0.0.7").unwrap().unwrap();
        assert_eq!(latest["temperatureVal"], "33");
    }

    #[test]
    fn queries_do_not_create_table_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();

        assert!(store.read_latest_by_client("ghost", "10.0.0.1").unwrap().is_none());
        assert!(store.distinct_values("ghost", CLIENT_ID_FIELD).unwrap().is_empty());
        assert!(store.distinct_values("ghost", "temperatureVal").unwrap().is_empty());
        assert!(!dir.path().join("ghost.jsonl").exists());

        store.insert("ghost", &row("10.0.0.1", "20")).unwrap();
        assert!(dir.path().join("ghost.jsonl").exists());
    }

    #[test]
    fn client_ids_come_from_index_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonlStore::open(dir.path()).unwrap();
            for (client, temp) in [("10.0.0.3", "1"), ("10.0.0.1", "2"), ("10.0.0.3", "3")] {
                store.insert("envtable", &row(client, temp)).unwrap();
            }
        }

        let store = JsonlStore::open(dir.path()).unwrap();
        store.insert("envtable", &row("10.0.0.2", "4")).unwrap();
        assert_eq!(
            store.distinct_values("envtable", CLIENT_ID_FIELD).unwrap(),
            vec!["10.0.0.3", "10.0.0.1", "10.0.0.2"]
        );
        assert_eq!(
            store.distinct_values("envtable", "temperatureVal").unwrap(),
            vec!["1", "2", "3", "4"]
        );
    }

    #[test]
    fn rejects_bad_table_names_and_empty_rows() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.insert("../etc", &row("a", "1")),
            Err(StorageError::InvalidTable(_))
        ));
        assert!(matches!(
            store.insert("envtable", &Row::new()),
            Err(StorageError::EmptyRow(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let jsonl = JsonlStore::open(dir.path()).unwrap();
        assert!(matches!(
            jsonl.read_latest_by_client("a/b", "x"),
            Err(StorageError::InvalidTable(_))
        ));
    }
}
