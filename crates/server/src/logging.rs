//! Logging do servidor: console + arquivo diário em `logs/`.
//!
//! Cada execução grava em `YYYY-MM-DD-N.log`, com `N` começando em 1 e
//! incrementado enquanto já existir arquivo com o mesmo nome.

use std::fs::File;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Variável de ambiente com o diretório de logs.
pub const LOG_DIR_ENV: &str = "ENVMON_LOG_DIR";

const DEFAULT_LOG_DIR: &str = "logs";

/// Diretório de logs configurado pelo ambiente.
pub fn log_dir() -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

/// Próximo arquivo livre `<data>-<n>.log` dentro de `dir`.
pub fn next_log_file(dir: &Path, date: &str) -> PathBuf {
    (1u32..)
        .map(|n| dir.join(format!("{date}-{n}.log")))
        .find(|path| !path.exists())
        .unwrap_or_else(|| dir.join(format!("{date}.log")))
}

/// Inicializa o subscriber global.
///
/// Se o arquivo não puder ser criado, segue só com o console e devolve o
/// erro para ser registrado depois da inicialização.
pub fn init(dir: &Path) -> Result<PathBuf, std::io::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let console = fmt::layer().with_target(false);

    let file = std::fs::create_dir_all(dir).and_then(|()| {
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let path = next_log_file(dir, &date);
        File::create(&path).map(|file| (path, file))
    });

    match file {
        Ok((path, file)) => {
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file_layer)
                .init();
            Ok(path)
        }
        Err(e) => {
            tracing_subscriber::registry().with(filter).with(console).init();
            Err(e)
        }
    }
}
