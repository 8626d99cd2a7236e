//! HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::compat::CompatibilityShim;
use crate::dispatcher::EntityCommand;
use crate::error::CommandError;
use crate::registry::DeviceHandle;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    shim: Arc<CompatibilityShim>,
    version: String,
}

impl AppState {
    pub fn new(shim: Arc<CompatibilityShim>, version: impl Into<String>) -> Self {
        Self {
            shim,
            version: version.into(),
        }
    }

    /// Device addressed by the routes without a vehicle id.
    fn primary(&self) -> Result<Arc<DeviceHandle>, CommandError> {
        self.shim
            .registry()
            .primary()
            .ok_or_else(|| CommandError::NotFound("no device configured".into()))
    }

    fn vehicle(&self, vin: &str) -> Result<Arc<DeviceHandle>, CommandError> {
        self.shim
            .registry()
            .find_ignore_case(vin)
            .ok_or_else(|| CommandError::NotFound("Unknown vehicle VIN".into()))
    }
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        let status = match &self {
            CommandError::NotFound(_) => StatusCode::NOT_FOUND,
            CommandError::BadRequest(_) | CommandError::UnsupportedOperation { .. } => {
                StatusCode::BAD_REQUEST
            }
            CommandError::ServiceUnavailable(_) | CommandError::CommandFailed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, CommandError>;

/// Create the HTTP router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .route("/state/:name", get(state_handler))
        .route("/entities", get(entities_handler))
        .route("/command/:name", post(command_handler))
        .route("/vehicle_data", get(vehicle_data_handler))
        .route("/button/:object_id/press", post(button_handler))
        .route("/switch/:object_id", post(switch_handler))
        .route("/number/:object_id", post(number_handler))
        .route("/vehicle/battery", get(battery_handler))
        .route("/vehicle/wake_up", post(wake_up_handler))
        .route("/vehicle/charger", post(charger_handler))
        .route("/vehicle/charging_amps", post(charging_amps_handler))
        .route("/vehicle/charging_limit", post(charging_limit_handler))
        .route("/api/1/vehicles/:vin/command/:command", post(fleet_command_handler))
        .route("/api/1/vehicles/:vin/vehicle_data", get(fleet_vehicle_data_handler))
        .route(
            "/api/1/vehicles/:vin/body_controller_state",
            get(fleet_body_controller_handler),
        )
        .route("/api/proxy/1/version", get(version_handler))
        .layer(middleware::from_fn(log_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Access log. Health checks are logged at debug level.
async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = std::time::Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if path.starts_with("/health") {
        tracing::debug!(%method, %path, status, elapsed_ms, "HTTP request");
    } else {
        tracing::info!(%method, %path, status, elapsed_ms, "HTTP request");
    }
    response
}

/// Optional JSON body; empty means absent.
fn json_body(bytes: &Bytes) -> Result<Option<Value>, CommandError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(bytes)
        .map(Some)
        .map_err(|e| CommandError::BadRequest(format!("invalid JSON body: {e}")))
}

fn fleet(data: Value) -> Json<Value> {
    Json(json!({ "response": data }))
}

fn sections(endpoints: Option<&str>) -> Option<Vec<String>> {
    endpoints.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

async fn live_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready_handler(State(state): State<AppState>) -> Response {
    let registry = state.shim.registry();
    let devices: Vec<Value> = registry
        .devices()
        .iter()
        .map(|d| {
            json!({
                "id": d.id(),
                "state": d.state(),
                "initialized": d.is_initialized(),
                "attached": d.is_attached(),
            })
        })
        .collect();

    let (status, label) = if registry.any_attached() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    (status, Json(json!({ "status": label, "devices": devices }))).into_response()
}

async fn state_handler(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let device = state.primary()?;
    let value = state.shim.state(device.id(), &name)?;
    Ok(Json(json!({ "name": name, "value": value })))
}

async fn entities_handler(State(state): State<AppState>) -> ApiResult {
    let device = state.primary()?;
    let entities = state.shim.entities(device.id())?;
    Ok(Json(json!(entities)))
}

#[derive(Debug, Default, Deserialize)]
struct WaitQuery {
    #[serde(default)]
    wait: bool,
}

async fn command_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<WaitQuery>,
    body: Bytes,
) -> ApiResult {
    let device = state.primary()?;
    let body = json_body(&body)?;
    state
        .shim
        .command(device.id(), &name, body.as_ref(), query.wait)
        .await?;
    Ok(fleet(json!({ "result": true })))
}

#[derive(Debug, Default, Deserialize)]
struct EndpointsQuery {
    endpoints: Option<String>,
}

async fn vehicle_data_handler(
    State(state): State<AppState>,
    Query(query): Query<EndpointsQuery>,
) -> ApiResult {
    let device = state.primary()?;
    let wanted = sections(query.endpoints.as_deref());
    let doc = state.shim.vehicle_data(device.id(), wanted.as_deref())?;
    Ok(fleet(doc))
}

#[derive(Debug, Deserialize)]
struct SwitchQuery {
    state: bool,
}

#[derive(Debug, Deserialize)]
struct NumberQuery {
    value: f64,
}

async fn button_handler(State(state): State<AppState>, Path(object_id): Path<String>) -> ApiResult {
    let device = state.primary()?;
    state
        .shim
        .entity_command(device.id(), &EntityCommand::press(object_id.as_str()))
        .await?;
    Ok(Json(json!({ "pressed": object_id })))
}

async fn switch_handler(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
    Query(query): Query<SwitchQuery>,
) -> ApiResult {
    let device = state.primary()?;
    state
        .shim
        .entity_command(device.id(), &EntityCommand::switch(object_id, query.state))
        .await?;
    Ok(Json(json!({ "state": query.state })))
}

async fn number_handler(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
    Query(query): Query<NumberQuery>,
) -> ApiResult {
    let device = state.primary()?;
    state
        .shim
        .entity_command(device.id(), &EntityCommand::number(object_id, query.value))
        .await?;
    Ok(Json(json!({ "value": query.value })))
}

async fn battery_handler(State(state): State<AppState>) -> ApiResult {
    let device = state.primary()?;
    Ok(Json(state.shim.battery(device.id())?))
}

async fn wake_up_handler(State(state): State<AppState>) -> ApiResult {
    let device = state.primary()?;
    state
        .shim
        .entity_command(device.id(), &EntityCommand::press("wake_up"))
        .await?;
    Ok(Json(json!({ "pressed": "wake_up" })))
}

async fn charger_handler(
    State(state): State<AppState>,
    Query(query): Query<SwitchQuery>,
) -> ApiResult {
    let device = state.primary()?;
    state
        .shim
        .entity_command(device.id(), &EntityCommand::switch("charger", query.state))
        .await?;
    Ok(Json(json!({ "state": query.state })))
}

async fn charging_amps_handler(
    State(state): State<AppState>,
    Query(query): Query<NumberQuery>,
) -> ApiResult {
    let device = state.primary()?;
    state
        .shim
        .entity_command(device.id(), &EntityCommand::number("charging_amps", query.value))
        .await?;
    Ok(Json(json!({ "value": query.value })))
}

async fn charging_limit_handler(
    State(state): State<AppState>,
    Query(query): Query<NumberQuery>,
) -> ApiResult {
    let device = state.primary()?;
    state
        .shim
        .entity_command(device.id(), &EntityCommand::number("charging_limit", query.value))
        .await?;
    Ok(Json(json!({ "value": query.value })))
}

async fn fleet_command_handler(
    State(state): State<AppState>,
    Path((vin, command)): Path<(String, String)>,
    Query(query): Query<WaitQuery>,
    body: Bytes,
) -> ApiResult {
    let device = state.vehicle(&vin)?;
    let body = json_body(&body)?;
    state
        .shim
        .command(device.id(), &command, body.as_ref(), query.wait)
        .await?;
    Ok(fleet(json!({ "result": true })))
}

async fn fleet_vehicle_data_handler(
    State(state): State<AppState>,
    Path(vin): Path<String>,
    Query(query): Query<EndpointsQuery>,
) -> ApiResult {
    let device = state.vehicle(&vin)?;
    let wanted = sections(query.endpoints.as_deref());
    let doc = state.shim.vehicle_data(device.id(), wanted.as_deref())?;
    Ok(fleet(doc))
}

async fn fleet_body_controller_handler(
    State(state): State<AppState>,
    Path(vin): Path<String>,
) -> ApiResult {
    let device = state.vehicle(&vin)?;
    Ok(fleet(state.shim.body_controller_state(device.id())?))
}

async fn version_handler(State(state): State<AppState>) -> Json<Value> {
    fleet(json!({ "version": state.version }))
}

/// HTTP server.
pub struct HttpServer {
    state: AppState,
    listen_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(state: AppState, listen_addr: SocketAddr) -> Self {
        Self { state, listen_addr }
    }

    /// Run the HTTP server until the shutdown token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let router = create_router(self.state);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
