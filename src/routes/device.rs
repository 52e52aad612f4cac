//! Device operation endpoints.
//!
//! One route per wallet operation, mirroring the relay's command set. Every
//! route except `/authenticate` requires an authenticated device session.
//!
//! Errors are `{"error": "...", "code": "..."}`:
//!
//! | Status | Code                | Cause                                   |
//! |--------|---------------------|-----------------------------------------|
//! | 400    | `MISSING_FIELD`     | required body field absent or empty     |
//! | 400    | `BAD_REQUEST`       | body is not valid JSON for the route    |
//! | 400    | `INVALID_ARGUMENT`  | value cannot be sent to the device      |
//! | 401    | `AUTH_FAILED`       | device rejected the password            |
//! | 401    | `NOT_AUTHENTICATED` | no authenticated session                |
//! | 409    | `INVALID_STATE`     | session state does not allow the call   |
//! | 504    | `TIMEOUT`           | device did not answer in time           |
//! | 500    | `DEVICE_ERROR`      | anything else                           |

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::device::DeviceError;
use crate::relay::RelayError;
use crate::session::SessionError;
use crate::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

#[derive(Deserialize)]
pub struct PasswordBody {
    pub password: Option<String>,
}

#[derive(Deserialize)]
pub struct NftBody {
    pub nft: Option<String>,
}

#[derive(Deserialize)]
pub struct MsgBody {
    pub msg: Option<String>,
}

fn api_error(status: StatusCode, code: &str, error: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"error": error.to_string(), "code": code})))
}

fn device_error(e: &DeviceError) -> (StatusCode, Json<Value>) {
    match e {
        DeviceError::Timeout(_) => api_error(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", e),
        DeviceError::InvalidArgument(_) => api_error(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", e),
        _ => api_error(StatusCode::INTERNAL_SERVER_ERROR, "DEVICE_ERROR", e),
    }
}

fn session_error(e: &SessionError) -> (StatusCode, Json<Value>) {
    match e {
        SessionError::EmptyPassword => {
            api_error(StatusCode::BAD_REQUEST, "MISSING_FIELD", "Password is required")
        }
        SessionError::InvalidState(_) => api_error(StatusCode::CONFLICT, "INVALID_STATE", e),
        SessionError::Device(DeviceError::ProtocolMismatch { .. }) => {
            api_error(StatusCode::UNAUTHORIZED, "AUTH_FAILED", "Authentication failed")
        }
        SessionError::Device(d) => device_error(d),
    }
}

fn relay_error(e: &RelayError) -> (StatusCode, Json<Value>) {
    match e {
        RelayError::NotAuthenticated => {
            api_error(StatusCode::UNAUTHORIZED, "NOT_AUTHENTICATED", e)
        }
        RelayError::UnknownCommand(_) | RelayError::MissingArgument(_) => {
            api_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", e)
        }
        RelayError::Session(s) => session_error(s),
        RelayError::Device(d) => device_error(d),
    }
}

/// Pull one required, non-empty string field out of a JSON body. A request
/// with no JSON body at all counts as a missing field.
fn required<T>(
    body: Result<Json<T>, JsonRejection>,
    field: impl FnOnce(T) -> Option<String>,
    message: &str,
) -> Result<String, (StatusCode, Json<Value>)> {
    let value = match body {
        Ok(Json(body)) => field(body),
        Err(JsonRejection::MissingJsonContentType(_)) => None,
        Err(e) => return Err(api_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", e.body_text())),
    };
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "MISSING_FIELD", message))
}

/// Wrap a relay result as `{field: value}`.
fn reply(field: &str, what: &str, result: Result<String, RelayError>) -> ApiResult {
    match result {
        Ok(value) => {
            let mut body = serde_json::Map::new();
            body.insert(field.to_string(), Value::String(value));
            Ok(Json(Value::Object(body)))
        }
        Err(e) => {
            warn!("API: {what} failed: {e}");
            Err(relay_error(&e))
        }
    }
}

/// `POST /authenticate`: `{"password"}` → `{"message"}`.
pub async fn authenticate(
    State(state): State<AppState>,
    body: Result<Json<PasswordBody>, JsonRejection>,
) -> ApiResult {
    let password = required(body, |b| b.password, "Password is required")?;
    match state.bridge.authenticate(&password).await {
        Ok(()) => Ok(Json(json!({"message": "Authentication successful"}))),
        Err(e) => {
            warn!("API: authentication failed: {e}");
            Err(session_error(&e))
        }
    }
}

/// `POST /logout`
pub async fn logout(State(state): State<AppState>) -> ApiResult {
    match state.bridge.logout().await {
        Ok(()) => Ok(Json(json!({"message": "Logged out successfully"}))),
        Err(RelayError::NotAuthenticated) => Err(relay_error(&RelayError::NotAuthenticated)),
        Err(e) => {
            warn!("API: logout failed: {e}");
            let (status, _) = relay_error(&e);
            let status = if status == StatusCode::GATEWAY_TIMEOUT {
                status
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            Err(api_error(status, "LOGOUT_FAILED", format!("Logout failed: {e}")))
        }
    }
}

/// `GET /getreqnft`
pub async fn get_req_nft(State(state): State<AppState>) -> ApiResult {
    reply("nft", "getreqnft", state.bridge.get_req_nft().await)
}

/// `GET /getauthnft`
pub async fn get_auth_nft(State(state): State<AppState>) -> ApiResult {
    reply("nft", "getauthnft", state.bridge.get_auth_nft().await)
}

/// `POST /setreqnft`: `{"nft"}`
pub async fn set_req_nft(
    State(state): State<AppState>,
    body: Result<Json<NftBody>, JsonRejection>,
) -> ApiResult {
    let nft = required(body, |b| b.nft, "NFT is required")?;
    reply("message", "setreqnft", state.bridge.set_req_nft(&nft).await)
}

/// `POST /setauthnft`: `{"nft"}`
pub async fn set_auth_nft(
    State(state): State<AppState>,
    body: Result<Json<NftBody>, JsonRejection>,
) -> ApiResult {
    let nft = required(body, |b| b.nft, "NFT is required")?;
    reply("message", "setauthnft", state.bridge.set_auth_nft(&nft).await)
}

/// `POST /signreqnft`: `{"msg"}` → `{"signature"}`
pub async fn sign_req(
    State(state): State<AppState>,
    body: Result<Json<MsgBody>, JsonRejection>,
) -> ApiResult {
    let msg = required(body, |b| b.msg, "Message is required")?;
    reply("signature", "signreqmsg", state.bridge.sign_req(&msg).await)
}

/// `POST /signauthnft`: `{"msg"}` → `{"signature"}`
pub async fn sign_auth(
    State(state): State<AppState>,
    body: Result<Json<MsgBody>, JsonRejection>,
) -> ApiResult {
    let msg = required(body, |b| b.msg, "Message is required")?;
    reply("signature", "signauthmsg", state.bridge.sign_auth(&msg).await)
}

/// `POST /removereqnft`
pub async fn remove_req_nft(State(state): State<AppState>) -> ApiResult {
    reply("message", "removereqnft", state.bridge.remove_req().await)
}

/// `POST /removeauthnft`
pub async fn remove_auth_nft(State(state): State<AppState>) -> ApiResult {
    reply("message", "removeauthnft", state.bridge.remove_auth().await)
}

/// `GET /getreqaddr`
pub async fn get_req_addr(State(state): State<AppState>) -> ApiResult {
    reply("address", "getreqaddr", state.bridge.get_req_addr().await)
}

/// `GET /getauthaddr`
pub async fn get_auth_addr(State(state): State<AppState>) -> ApiResult {
    reply("address", "getauthaddr", state.bridge.get_auth_addr().await)
}
