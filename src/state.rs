//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::monitor::MonitorStats;

#[derive(Clone)]
pub struct AppState {
    /// The device bridge every route goes through.
    pub bridge: Bridge,
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the bridge started (for uptime calculation).
    pub start_time: Instant,
    /// Liveness counters, `None` when the monitor is disabled.
    pub monitor_stats: Option<Arc<MonitorStats>>,
}

impl AppState {
    #[must_use]
    pub fn new(bridge: Bridge, config: Arc<Config>, monitor_stats: Option<Arc<MonitorStats>>) -> Self {
        Self {
            bridge,
            config,
            start_time: Instant::now(),
            monitor_stats,
        }
    }
}
