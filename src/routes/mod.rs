//! HTTP route handlers.
//!
//! [`health`] is public; everything in [`device`] sits behind the
//! [`crate::auth::require_api_key`] middleware when an API key is configured.

pub mod device;
pub mod health;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::AppState;

/// Build the full API router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health::health));

    let mut device_routes = Router::new()
        .route("/authenticate", post(device::authenticate))
        .route("/logout", post(device::logout))
        .route("/getreqnft", get(device::get_req_nft))
        .route("/getauthnft", get(device::get_auth_nft))
        .route("/setreqnft", post(device::set_req_nft))
        .route("/setauthnft", post(device::set_auth_nft))
        .route("/signreqnft", post(device::sign_req))
        .route("/signauthnft", post(device::sign_auth))
        .route("/removereqnft", post(device::remove_req_nft))
        .route("/removeauthnft", post(device::remove_auth_nft))
        .route("/getreqaddr", get(device::get_req_addr))
        .route("/getauthaddr", get(device::get_auth_addr));

    if let Some(key) = state.config.api.api_key.clone() {
        device_routes = device_routes
            .layer(middleware::from_fn(auth::require_api_key))
            .layer(Extension(ApiKey(key)));
    }

    Router::new()
        .merge(public_routes)
        .merge(device_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
