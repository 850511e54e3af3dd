//! Control service: JSON-RPC 2.0 over HTTP.
//!
//! ```text
//! POST /  or  POST /api ──→ handle_json_rpc ──→ route_method ──→ rpc::{tank,network,scenarios,debug}
//! GET  /health
//! ```
//!
//! A body holding an array is a batch; responses keep request order.

use crate::error::{ApiError, ApiResult};
use crate::rpc::RpcHandlers;
use crate::state::ServerState;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use warnet_core::config::ServerConfig;
use warnet_core::domain::ServiceType;
use warnet_core::ports::LogScope;

/// Longest accepted string request id
const MAX_ID_LEN: usize = 256;

pub struct ControlService {
    config: ServerConfig,
    handlers: Arc<RpcHandlers>,
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    handlers: Arc<RpcHandlers>,
}

impl ControlService {
    pub fn new(state: Arc<ServerState>) -> Self {
        let config = state.config().server.clone();
        Self {
            config,
            handlers: Arc::new(RpcHandlers::new(state)),
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            handlers: Arc::clone(&self.handlers),
        };
        Router::new()
            .route("/", post(handle_json_rpc))
            .route("/api", post(handle_json_rpc))
            .route("/health", get(health_check))
            .layer(TimeoutLayer::new(self.config.request_timeout))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> std::io::Result<()> {
        let addr = self.config.addr();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "control server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Handle a JSON-RPC request or batch
async fn handle_json_rpc(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let request: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_response(Value::Null, &ApiError::parse_error(e))),
            );
        }
    };

    let response = match &request {
        Value::Array(requests) if requests.is_empty() => {
            error_response(Value::Null, &ApiError::invalid_request("empty batch"))
        }
        Value::Array(requests) => {
            let mut responses = Vec::with_capacity(requests.len());
            for req in requests {
                responses.push(process_single_request(&state, req).await);
            }
            Value::Array(responses)
        }
        single => process_single_request(&state, single).await,
    };
    (StatusCode::OK, Json(response))
}

fn error_response(id: Value, error: &ApiError) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error.to_json() })
}

fn validate_id(id: &Value) -> ApiResult<()> {
    match id {
        Value::Null | Value::Number(_) => Ok(()),
        Value::String(s) if s.is_empty() => Err(ApiError::invalid_request("empty string id")),
        Value::String(s) if s.len() > MAX_ID_LEN => Err(ApiError::invalid_request(format!(
            "id string too long (max {MAX_ID_LEN} chars)"
        ))),
        Value::String(_) => Ok(()),
        _ => Err(ApiError::invalid_request("id must be string or number")),
    }
}

/// Process a single JSON-RPC request
async fn process_single_request(state: &AppState, request: &Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    if let Err(e) = validate_id(&id) {
        return error_response(Value::Null, &e);
    }
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return error_response(id, &ApiError::invalid_request("missing method"));
    };
    let params = request.get("params");

    match route_method(state, method, params).await {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(e) => {
            debug!(method, code = e.code, message = %e.message, "request failed");
            error_response(id, &e)
        }
    }
}

fn to_json<T: Serialize>(value: T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(ApiError::internal)
}

/// Route a JSON-RPC method to its handler.
async fn route_method(state: &AppState, method: &str, params: Option<&Value>) -> ApiResult<Value> {
    let rpc = &state.handlers;
    match method {
        // ═══════════════════════════════════════════════════════════════════
        // TANK NAMESPACE
        // ═══════════════════════════════════════════════════════════════════
        "tank_bcli" => {
            let index: usize = parse_param(params, 0, "node")?;
            let bitcoin_method: String = parse_param(params, 1, "method")?;
            let args: Vec<Value> = parse_param_optional(params, 2, "params").unwrap_or_default();
            to_json(rpc.tank.bcli(index, &bitcoin_method, &args).await?)
        }

        "tank_lncli" => {
            let index: usize = parse_param(params, 0, "node")?;
            let command = match parse_param::<Value>(params, 1, "command")? {
                Value::String(s) => s,
                other => serde_json::from_value::<Vec<String>>(other)
                    .map_err(|e| ApiError::invalid_params(format!("command must be a string or list: {e}")))?
                    .join(" "),
            };
            to_json(rpc.tank.lncli(index, &command).await?)
        }

        "tank_debug_log" => {
            let index: usize = parse_param(params, 0, "node")?;
            to_json(rpc.tank.debug_log(index).await?)
        }

        "tank_messages" => {
            let a: usize = parse_param(params, 0, "node_a")?;
            let b: usize = parse_param(params, 1, "node_b")?;
            to_json(rpc.tank.messages(a, b).await?)
        }

        "tank_ln_pub_key" => {
            let index: usize = parse_param(params, 0, "node")?;
            to_json(rpc.tank.ln_pub_key(index).await?)
        }

        // ═══════════════════════════════════════════════════════════════════
        // SCENARIOS NAMESPACE
        // ═══════════════════════════════════════════════════════════════════
        "scenarios_available" => to_json(rpc.scenarios.available().await?),

        "scenarios_run" => {
            let name: String = parse_param(params, 0, "scenario")?;
            let args: Vec<String> = parse_param_optional(params, 1, "additional_args").unwrap_or_default();
            to_json(rpc.scenarios.run(&name, &args).await?)
        }

        "scenarios_run_file" => {
            let encoded: String = parse_param(params, 0, "scenario_base64")?;
            let name: String = parse_param(params, 1, "scenario_name")?;
            let args: Vec<String> = parse_param_optional(params, 2, "additional_args").unwrap_or_default();
            to_json(rpc.scenarios.run_file(&encoded, &name, &args).await?)
        }

        "scenarios_stop" => {
            let pid: Value = parse_param(params, 0, "pid")?;
            let job_id = match pid {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                other => return Err(ApiError::invalid_params(format!("pid must be string or number, got {other}"))),
            };
            to_json(rpc.scenarios.stop(&job_id).await?)
        }

        "scenarios_list_running" => to_json(rpc.scenarios.list_running().await?),

        // ═══════════════════════════════════════════════════════════════════
        // NETWORK NAMESPACE
        // ═══════════════════════════════════════════════════════════════════
        "network_up" => to_json(rpc.network.up().await?),

        "network_from_file" => {
            let encoded: String = parse_param(params, 0, "graph_file")?;
            let force: bool = parse_param_optional(params, 1, "force").unwrap_or(false);
            to_json(rpc.network.from_file(&encoded, force).await?)
        }

        "network_down" => to_json(rpc.network.down().await?),

        "network_info" => to_json(rpc.network.info().await?),

        "network_status" => to_json(rpc.network.status().await?),

        "network_connected" => to_json(rpc.network.connected().await?),

        "network_export" => {
            let dir: Option<PathBuf> = parse_param_optional(params, 0, "dir");
            to_json(rpc.network.export(dir).await?)
        }

        "network_ln_init" => to_json(rpc.network.ln_init().await?),

        // ═══════════════════════════════════════════════════════════════════
        // DEPLOYMENT AND DEBUG
        // ═══════════════════════════════════════════════════════════════════
        "generate_deployment" => to_json(rpc.debug.generate_deployment().await?),

        "exec_run" => {
            let index: usize = parse_param(params, 0, "index")?;
            let service: String = parse_param(params, 1, "service_type")?;
            let service: ServiceType = service.parse().map_err(ApiError::invalid_params)?;
            let cmd: String = parse_param(params, 2, "cmd")?;
            to_json(rpc.debug.exec_run(index, service, &cmd).await?)
        }

        "logs_grep" => {
            let pattern: String = parse_param(params, 0, "pattern")?;
            let scope: LogScope = parse_param_optional(params, 1, "scope").unwrap_or(LogScope::All);
            to_json(rpc.debug.logs_grep(&pattern, scope).await?)
        }

        // ═══════════════════════════════════════════════════════════════════
        // UNKNOWN METHOD
        // ═══════════════════════════════════════════════════════════════════
        _ => Err(ApiError::method_not_found(method)),
    }
}

/// Positional (`params[index]`) or named (`params[name]`) parameter
fn param<'a>(params: Option<&'a Value>, index: usize, name: &str) -> Option<&'a Value> {
    match params? {
        Value::Array(items) => items.get(index),
        Value::Object(fields) => fields.get(name),
        _ => None,
    }
    .filter(|v| !v.is_null())
}

/// Parse a required parameter.
fn parse_param<T: DeserializeOwned>(params: Option<&Value>, index: usize, name: &str) -> ApiResult<T> {
    let value = param(params, index, name)
        .ok_or_else(|| ApiError::invalid_params(format!("missing parameter {name} at index {index}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ApiError::invalid_params(format!("invalid parameter {name} at index {index}: {e}")))
}

/// Parse an optional parameter; a malformed value counts as absent.
fn parse_param_optional<T: DeserializeOwned>(params: Option<&Value>, index: usize, name: &str) -> Option<T> {
    param(params, index, name).and_then(|v| serde_json::from_value(v.clone()).ok())
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "warnet-server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
