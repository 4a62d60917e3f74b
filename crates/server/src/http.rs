//! API HTTP de consulta (somente leitura).
//!
//! Expõe o que já foi decidido pela ingestão, sem tomar nenhuma decisão de
//! alarme:
//!
//! | rota                      | conteúdo                                  |
//! |---------------------------|-------------------------------------------|
//! | `GET /api/clientip`       | clientes distintos gravados no storage    |
//! | `GET /api/record?ip=<ip>` | última linha gravada do cliente           |
//! | `GET /api/alarm`          | mensagem de alarme atual por cliente      |
//! | `GET /api/threshold`      | thresholds ativos                         |
//!
//! Toda resposta segue o envelope `{"code": <status>, "data": <conteúdo>}`.
//! Fora de `/api`, os arquivos do diretório montado (frontend web) são
//! servidos como estão.

use axum::extract::{Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use envmon_core::alarm::AlarmEngine;
use envmon_core::storage::{Storage, StorageError};
use envmon_core::types::CLIENT_ID_FIELD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{error, info};

/// Estado compartilhado pelos handlers.
#[derive(Clone)]
pub struct ApiState {
    pub storage: Arc<dyn Storage>,
    pub engine: Arc<AlarmEngine>,
    pub table: String,
    pub log_operations: bool,
    /// Diretório servido em `/`; `None` deixa só a API.
    pub mount_dir: Option<PathBuf>,
}

/// Envelope padrão das respostas.
#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    code: u16,
    data: T,
}

fn respond<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(ApiResponse {
            code: status.as_u16(),
            data,
        }),
    )
        .into_response()
}

/// Entrada da lista de alarmes.
#[derive(Debug, Serialize)]
struct AlarmEntry {
    ip: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RecordQuery {
    #[serde(default)]
    ip: String,
}

pub fn build_router(state: ApiState) -> Router {
    let router = Router::new()
        .route("/api/clientip", get(client_ips))
        .route("/api/record", get(record))
        .route("/api/alarm", get(alarms))
        .route("/api/threshold", get(thresholds))
        .route("/api/{*rest}", get(unknown_api));

    let router = match &state.mount_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };
    router.with_state(state)
}

/// Sobe a API numa thread própria com runtime Tokio dedicado.
///
/// Falha de bind encerra só a API; a ingestão TCP continua.
pub fn spawn_http_server(addr: SocketAddr, state: ApiState) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("http-api".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Falha ao criar runtime da API HTTP: {e}");
                    return;
                }
            };

            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::bind(addr).await {
                    Ok(l) => l,
                    Err(e) => {
                        error!("Falha ao bind da API HTTP em {addr}: {e}");
                        return;
                    }
                };
                info!("API HTTP em http://{addr}");
                if let Err(e) = axum::serve(listener, build_router(state)).await {
                    error!("API HTTP encerrada: {e}");
                }
            });
        })
}

// ──────────────────────────────────────────────
// Handlers
// ──────────────────────────────────────────────

/// Executa uma consulta de storage fora das threads do runtime.
async fn blocking_storage<T, F>(state: &ApiState, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&dyn Storage, &str) -> Result<T, StorageError> + Send + 'static,
{
    let storage = Arc::clone(&state.storage);
    let table = state.table.clone();

    match tokio::task::spawn_blocking(move || f(storage.as_ref(), &table)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            error!("Consulta ao storage falhou: {e}");
            Err(respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
        Err(e) => {
            error!("Tarefa de consulta abortada: {e}");
            Err(respond(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
        }
    }
}

fn log_request(state: &ApiState, uri: &Uri, status: StatusCode) {
    if state.log_operations {
        info!("HTTP GET {uri} → {}", status.as_u16());
    }
}

async fn client_ips(State(state): State<ApiState>, uri: Uri) -> Response {
    let result = blocking_storage(&state, |storage, table| {
        storage.distinct_values(table, CLIENT_ID_FIELD)
    })
    .await;

    let response = match result {
        Ok(ips) => respond(StatusCode::OK, ips),
        Err(resp) => resp,
    };
    log_request(&state, &uri, response.status());
    response
}

async fn record(State(state): State<ApiState>, Query(query): Query<RecordQuery>, uri: Uri) -> Response {
    let ip = query.ip;
    let result = blocking_storage(&state, move |storage, table| {
        storage.read_latest_by_client(table, &ip)
    })
    .await;

    let response = match result {
        Ok(row) => respond(StatusCode::OK, row.unwrap_or_default()),
        Err(resp) => resp,
    };
    log_request(&state, &uri, response.status());
    response
}

async fn alarms(State(state): State<ApiState>, uri: Uri) -> Response {
    let entries: Vec<AlarmEntry> = state
        .engine
        .alarm_messages()
        .into_iter()
        .map(|(ip, message)| AlarmEntry { ip, message })
        .collect();

    let response = respond(StatusCode::OK, entries);
    log_request(&state, &uri, response.status());
    response
}

async fn thresholds(State(state): State<ApiState>, uri: Uri) -> Response {
    let response = respond(StatusCode::OK, state.engine.thresholds().as_map());
    log_request(&state, &uri, response.status());
    response
}

async fn unknown_api(State(state): State<ApiState>, uri: Uri) -> Response {
    let response = respond(StatusCode::NOT_FOUND, Value::from("Invalid api"));
    log_request(&state, &uri, response.status());
    response
}
