//! # Environment Monitor Server
//!
//! Recebe leituras de sensores via TCP, grava cada linha no storage e
//! responde `ack`, `alarm_active` ou `error` conforme o motor de alarmes.
//! Opcionalmente expõe uma API HTTP de consulta.
//!
//! ## Uso
//! ```bash
//! envmon_server                                   # configs/envmon.toml ao lado do executável
//! ENVMON_CONFIG=./envmon.toml envmon_server       # arquivo explícito
//! RUST_LOG=debug ENVMON_LOG_DIR=/var/log/envmon envmon_server
//! ```

mod dispatcher;
mod http;
mod logging;
mod persist;

use anyhow::Context;
use dispatcher::{ConnectionContext, Dispatcher};
use envmon_core::alarm::AlarmEngine;
use envmon_core::config::AppConfig;
use envmon_core::storage::{JsonlStore, MemoryStore, Storage};
use envmon_core::thresholds::ThresholdTable;
use envmon_core::types::CLIENT_ID_FIELD;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() -> anyhow::Result<()> {
    // ── Logging ──
    let log_dir = logging::log_dir();
    match logging::init(&log_dir) {
        Ok(path) => info!("Log em {}", path.display()),
        Err(e) => warn!("Log em arquivo desativado ({}): {e}", log_dir.display()),
    }

    // ── Carregar config ──
    let config_path = AppConfig::default_path();
    let config = AppConfig::load(&config_path);

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }
    for problem in config.validate() {
        warn!("Config: {problem}");
    }
    let server_cfg = &config.server;

    // ── Thresholds e motor de alarmes ──
    let thresholds = Arc::new(ThresholdTable::from_config(server_cfg));
    if thresholds.is_empty() {
        warn!("Nenhum threshold configurado: todas as leituras receberão ack");
    }
    for (metric, limit) in thresholds.iter() {
        info!("Threshold {metric} = {limit}");
    }
    let engine = Arc::new(AlarmEngine::from_config(server_cfg, Arc::clone(&thresholds)));

    // ── Storage ──
    let storage: Arc<dyn Storage> = match JsonlStore::open(&server_cfg.data_dir) {
        Ok(store) => {
            info!("Storage JSON Lines em {}", store.dir().display());
            Arc::new(store)
        }
        Err(e) => {
            error!("Falha ao abrir storage em {}: {e}", server_cfg.data_dir.display());
            warn!("Usando storage em memória: leituras não sobrevivem a reinícios");
            Arc::new(MemoryStore::new())
        }
    };

    let known_clients = storage
        .distinct_values(&server_cfg.table_name, CLIENT_ID_FIELD)
        .unwrap_or_else(|e| {
            warn!("Não foi possível listar clientes conhecidos: {e}");
            Vec::new()
        });
    info!("{} cliente(s) conhecido(s) no storage", known_clients.len());

    let (persist, _writer) = persist::spawn_writer(
        Arc::clone(&storage),
        server_cfg.table_name.clone(),
        persist::DEFAULT_QUEUE_CAPACITY,
    )
    .context("Falha ao iniciar writer de persistência")?;

    // ── API HTTP ──
    if server_cfg.http_enabled {
        match server_cfg.http_addr().parse::<SocketAddr>() {
            Ok(addr) => {
                let mount_dir = &server_cfg.http_mount_dir;
                let mount_dir = if mount_dir.is_dir() {
                    info!("Frontend servido de {}", mount_dir.display());
                    Some(mount_dir.clone())
                } else {
                    warn!("Diretório do frontend {} ausente, servindo só /api", mount_dir.display());
                    None
                };
                let state = http::ApiState {
                    storage: Arc::clone(&storage),
                    engine: Arc::clone(&engine),
                    table: server_cfg.table_name.clone(),
                    log_operations: server_cfg.log_operations,
                    mount_dir,
                };
                if let Err(e) = http::spawn_http_server(addr, state) {
                    error!("Falha ao iniciar API HTTP: {e}");
                }
            }
            Err(e) => error!("Endereço HTTP inválido {}: {e}", server_cfg.http_addr()),
        }
    }

    // ── Dispatcher TCP ──
    let ctx = ConnectionContext::new(Arc::clone(&engine), persist, server_cfg.log_operations)
        .with_known_clients(known_clients);
    let tcp_addr = server_cfg.tcp_addr();
    let dispatcher = Dispatcher::bind(&tcp_addr, ctx)
        .with_context(|| format!("Falha ao abrir servidor TCP em {tcp_addr}"))?;

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   🌡 ENVIRONMENT MONITOR SERVER – ATIVO");
    println!("══════════════════════════════════════════════");
    println!("  TCP:        {tcp_addr}");
    if server_cfg.http_enabled {
        println!("  HTTP:       http://{}", server_cfg.http_addr());
    }
    println!("  Tabela:     {}", server_cfg.table_name);
    println!("  Thresholds: {}", thresholds.len());
    println!("  Trava:      {}s", server_cfg.lock_duration().as_secs());
    println!("══════════════════════════════════════════════");
    println!();

    dispatcher.run();
    Ok(())
}
