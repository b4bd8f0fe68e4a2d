//! HTTP action handlers.
//!
//! Thin JSON layer over [`PollinationService`]. Each manager endpoint takes
//! an action envelope, checks the fields that action needs, and dispatches.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/dao-manager` | `create`, `update`, `get` |
//! | `POST` | `/need-manager` | `create`, `update`, `fulfill`, `updateContractId` |
//! | `GET`  | `/pollen-query` | Enriched pollen filtered by `dao_id`, `need_id`, `min_confidence` |
//! | `POST` | `/pollen-refresh` | Re-run matching for `needId` or `daoId` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Envelopes
//!
//! ```json
//! { "action": "update", "id": 3, "publicAddress": "0x…", "data": { … } }
//! ```
//!
//! Success is `{"status":"success","data":…}` with 200. Errors are
//! `{"error":"…"}` with 400 (validation), 404 (unknown id or address), or
//! 500 (external service or persistence failure).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; preflight requests are
//! answered by the CORS layer.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::PollenError;
use crate::models::{DaoInput, DaoUpdate, NeedInput, NeedUpdate, PollenQuery};
use crate::service::PollinationService;

/// Open the configured store and providers, then serve until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = PollinationService::open(config).await?;
    run_server_with_service(config, Arc::new(service)).await
}

/// Serve an already-built service on `[server].bind`. Tests use this to
/// inject fake capabilities.
pub async fn run_server_with_service(
    config: &Config,
    service: Arc<PollinationService>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "pollen server listening");
    println!("Pollen server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(service: Arc<PollinationService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/dao-manager", post(handle_dao_manager))
        .route("/need-manager", post(handle_need_manager))
        .route("/pollen-query", get(handle_pollen_query))
        .route("/pollen-refresh", post(handle_pollen_refresh))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

// ============ Envelopes ============

#[derive(Debug, Deserialize)]
struct ActionRequest {
    action: Option<String>,
    id: Option<i64>,
    #[serde(rename = "publicAddress")]
    public_address: Option<String>,
    data: Option<Value>,
}

#[derive(Serialize)]
struct Success<T: Serialize> {
    status: &'static str,
    data: T,
}

fn success<T: Serialize>(data: T) -> Json<Success<T>> {
    Json(Success {
        status: "success",
        data,
    })
}

type Reply = Result<Response, AppError>;

fn reply<T: Serialize>(data: T) -> Reply {
    Ok(success(data).into_response())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<PollenError> for AppError {
    fn from(err: PollenError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(%err, "request failed");
        }
        AppError {
            status,
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, AppError> {
    serde_json::from_str(body).map_err(|e| bad_request(format!("Failed to parse JSON: {}", e)))
}

fn parse_action(body: &str) -> Result<(String, ActionRequest), AppError> {
    let request: ActionRequest = parse_body(body)?;
    match request.action.as_deref().map(str::trim) {
        Some(action) if !action.is_empty() => Ok((action.to_string(), request)),
        _ => Err(bad_request("Missing action")),
    }
}

impl ActionRequest {
    fn require_id(&self) -> Result<i64, AppError> {
        self.id.ok_or_else(|| bad_request("id is required"))
    }

    fn data<T: DeserializeOwned>(&mut self) -> Result<T, AppError> {
        let data = self
            .data
            .take()
            .ok_or_else(|| bad_request("data is required"))?;
        serde_json::from_value(data).map_err(|e| bad_request(format!("Invalid data: {}", e)))
    }
}

// ============ POST /dao-manager ============

async fn handle_dao_manager(
    State(service): State<Arc<PollinationService>>,
    body: String,
) -> Reply {
    let (action, mut request) = parse_action(&body)?;
    match action.as_str() {
        "create" => {
            let input: DaoInput = request.data()?;
            reply(service.create_dao(input).await?)
        }
        "update" => {
            let id = request.require_id()?;
            let update: DaoUpdate = request.data()?;
            reply(service.update_dao(id, update).await?)
        }
        "get" => {
            let address = request
                .public_address
                .take()
                .ok_or_else(|| bad_request("publicAddress is required"))?;
            reply(service.get_dao_by_public_address(&address).await?)
        }
        _ => Err(bad_request("Invalid action")),
    }
}

// ============ POST /need-manager ============

#[derive(Deserialize)]
struct ContractIdData {
    contract_need_id: Option<Value>,
}

async fn handle_need_manager(
    State(service): State<Arc<PollinationService>>,
    body: String,
) -> Reply {
    let (action, mut request) = parse_action(&body)?;
    match action.as_str() {
        "create" => {
            let input: NeedInput = request.data()?;
            reply(service.create_need(input).await?)
        }
        "update" => {
            let id = request.require_id()?;
            let update: NeedUpdate = request.data()?;
            reply(service.update_need(id, update).await?)
        }
        "fulfill" => {
            let id = request.require_id()?;
            reply(service.mark_need_fulfilled(id).await?)
        }
        "updateContractId" => {
            let id = request.require_id()?;
            let data: ContractIdData = request.data()?;
            // The contract watcher sends the on-chain id as a number.
            let contract_need_id = match data.contract_need_id {
                Some(Value::String(s)) => s,
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(bad_request("contract_need_id is required")),
            };
            reply(service.update_contract_need_id(id, &contract_need_id).await?)
        }
        _ => Err(bad_request("Invalid action")),
    }
}

// ============ GET /pollen-query ============

async fn handle_pollen_query(
    State(service): State<Arc<PollinationService>>,
    query: Result<Query<PollenQuery>, QueryRejection>,
) -> Reply {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    reply(service.query_pollen(&query).await?)
}

// ============ POST /pollen-refresh ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    need_id: Option<i64>,
    dao_id: Option<i64>,
}

async fn handle_pollen_refresh(
    State(service): State<Arc<PollinationService>>,
    body: String,
) -> Reply {
    let request: RefreshRequest = parse_body(&body)?;
    match (request.need_id, request.dao_id) {
        (Some(need_id), None) => reply(service.engine().refresh_matches_for_need(need_id).await?),
        (None, Some(dao_id)) => reply(service.engine().refresh_matches_for_dao(dao_id).await?),
        _ => Err(bad_request("exactly one of needId or daoId is required")),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
