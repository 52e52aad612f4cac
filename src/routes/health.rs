//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health`: liveness probe.
///
/// Reports session state, whether a command is in flight, the device port
/// and the monitor counters. No authentication required, and it never
/// touches the device.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let bridge = &state.bridge;
    let monitor = state.monitor_stats.as_ref().map(|s| s.snapshot());
    let device_lost = monitor.is_some_and(|m| m.device_lost);

    Json(json!({
        "status": if device_lost { "device_lost" } else { "ok" },
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "port": bridge.transport().port(),
        "session": bridge.session_state(),
        "busy": bridge.busy().is_busy(),
        "monitor": monitor,
    }))
}
