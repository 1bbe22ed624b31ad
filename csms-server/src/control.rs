//! Operator-facing HTTP control API
//!
//! Thin axum layer over the connection registry: every command endpoint
//! looks up the charge point's session and awaits `Session::call`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use csms_core::ocpp::{
    AuthorizeRequest, BootNotificationRequest, RemoteStopTransactionRequest,
    RemoteStopTransactionResponse,
};
use csms_core::{Action, CallResponse, ConnectionRegistry, OcppError, ResponseSource, Session};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Transaction stopped by `/stop/{id}` when the body names none
pub const DEFAULT_TRANSACTION_ID: i32 = 12345;

/// idTag authorized by `/authorize/{id}` when the body names none
pub const DEFAULT_ID_TAG: &str = "default-id-tag";

const BOOT_MODEL: &str = "EVSE-123";
const BOOT_VENDOR: &str = "EV-Charger Inc.";

/// Shared state accessible from axum handlers
#[derive(Clone)]
pub struct ControlState {
    pub registry: Arc<ConnectionRegistry>,
}

/// Build the control API router
pub fn router(registry: Arc<ConnectionRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chargers", get(list_chargers))
        .route("/status/{id}", get(charger_status))
        .route("/command/{id}/{action}", post(send_command))
        .route("/start/{id}", post(remote_start))
        .route("/stop/{id}", post(remote_stop))
        .route("/authorize/{id}", post(remote_authorize))
        .with_state(ControlState { registry })
}

/// Result of a command sent to a charge point
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub charger_id: String,
    pub action: String,
    pub source: ResponseSource,
    pub result: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StopBody {
    transaction_id: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthorizeBody {
    id_tag: Option<String>,
}

/// Control API failures, rendered as `{"error": .., "code": ..}`
#[derive(Debug)]
pub enum ApiError {
    NotFound,
    BadRequest(String),
    /// The charge point answered with a payload that does not fit the action
    InvalidReply(String),
    Call(OcppError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                json!({"error": "Charger not found", "code": "NotFound"}),
            ),
            ApiError::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                json!({"error": reason, "code": "BadRequest"}),
            ),
            ApiError::InvalidReply(reason) => (
                StatusCode::BAD_GATEWAY,
                json!({"error": reason, "code": "InvalidReply"}),
            ),
            ApiError::Call(err) => {
                let status = match &err {
                    OcppError::CallTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    OcppError::Remote { .. }
                    | OcppError::ConnectionUnavailable
                    | OcppError::ConnectionClosed => StatusCode::BAD_GATEWAY,
                    OcppError::MalformedEnvelope(_) | OcppError::Json(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let mut body = json!({"error": err.to_string(), "code": err.kind()});
                if let OcppError::Remote { code, details, .. } = &err {
                    body["remote_code"] = json!(code.to_string());
                    body["details"] = details.clone();
                }
                (status, body)
            }
        };

        (status, Json(body)).into_response()
    }
}

fn lookup(state: &ControlState, id: &str) -> Result<Arc<Session>, ApiError> {
    state.registry.lookup(id).ok_or_else(|| {
        warn!("Command for unknown charger {}", id);
        ApiError::NotFound
    })
}

/// Empty bodies decode to `T::default()`
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

async fn call(
    state: &ControlState,
    id: &str,
    action: &str,
    payload: Value,
) -> Result<CallResponse, ApiError> {
    let session = lookup(state, id)?;
    info!("{}: operator command {}", id, action);

    session
        .call_with_default_timeout(action, payload)
        .await
        .map_err(ApiError::Call)
}

fn command_response(id: &str, action: &str, response: CallResponse) -> Json<CommandResponse> {
    Json(CommandResponse {
        charger_id: id.to_string(),
        action: action.to_string(),
        source: response.source,
        result: response.payload,
    })
}

async fn dispatch(
    state: &ControlState,
    id: &str,
    action: &str,
    payload: Value,
) -> Result<Json<CommandResponse>, ApiError> {
    let response = call(state, id, action, payload).await?;
    Ok(command_response(id, action, response))
}

fn to_payload(request: impl Serialize) -> Result<Value, ApiError> {
    serde_json::to_value(request).map_err(|e| ApiError::Call(OcppError::Json(e)))
}

/// GET /health
async fn health(State(state): State<ControlState>) -> Json<Value> {
    Json(json!({"status": "ok", "connections": state.registry.len()}))
}

/// GET /chargers
async fn list_chargers(State(state): State<ControlState>) -> Json<Value> {
    Json(json!({"active_chargers": state.registry.identities()}))
}

/// GET /status/{id}
async fn charger_status(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = lookup(&state, &id)?;
    Ok(Json(json!({"status": session.info()})))
}

/// POST /command/{id}/{action}
async fn send_command(
    State(state): State<ControlState>,
    Path((id, action)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<CommandResponse>, ApiError> {
    let payload = match parse_body::<Option<Value>>(&body)? {
        Some(payload) => payload,
        None => json!({}),
    };
    dispatch(&state, &id, &action, payload).await
}

/// POST /start/{id}
async fn remote_start(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    let payload = to_payload(BootNotificationRequest {
        charge_point_vendor: BOOT_VENDOR.to_string(),
        charge_point_model: BOOT_MODEL.to_string(),
        charge_point_serial_number: None,
        charge_box_serial_number: None,
        firmware_version: None,
        meter_type: None,
        meter_serial_number: None,
    })?;
    dispatch(&state, &id, Action::BootNotification.as_str(), payload).await
}

/// POST /stop/{id}
async fn remote_stop(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<CommandResponse>, ApiError> {
    let body: StopBody = parse_body(&body)?;
    let transaction_id = body.transaction_id.unwrap_or(DEFAULT_TRANSACTION_ID);
    let payload = to_payload(RemoteStopTransactionRequest { transaction_id })?;

    let action = Action::RemoteStopTransaction.as_str();
    let response = call(&state, &id, action, payload).await?;
    let answer: RemoteStopTransactionResponse = response.parse_payload().map_err(|e| {
        warn!("{}: unusable {} answer: {}", id, action, e);
        ApiError::InvalidReply(format!("Unexpected {} answer: {}", action, e))
    })?;
    info!("{}: transaction {} stop {:?}", id, transaction_id, answer.status);

    Ok(command_response(&id, action, response))
}

/// POST /authorize/{id}
async fn remote_authorize(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<CommandResponse>, ApiError> {
    let body: AuthorizeBody = parse_body(&body)?;
    let payload = to_payload(AuthorizeRequest {
        id_tag: body.id_tag.unwrap_or_else(|| DEFAULT_ID_TAG.to_string()),
    })?;
    dispatch(&state, &id, Action::Authorize.as_str(), payload).await
}
