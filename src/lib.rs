#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! swbridge library: the building blocks of the SecureWallet bridge.
//!
//! - `device`: serial link, command set and request/response protocol
//! - `session`: password-authenticated device session
//! - `relay`: inbound command relay with the auth gate and busy flag
//! - `handshake`: address exchange with the control server
//! - `remote`: line-framed control server connection
//! - `monitor`: background device liveness monitor
//! - `bridge`: facade tying the above together
//! - `routes` / `auth`: local HTTP API
//! - `prompt`, `discovery`, `config`, `supervisor`: startup plumbing

pub mod auth;
pub mod bridge;
pub mod config;
pub mod device;
pub mod discovery;
pub mod handshake;
pub mod monitor;
pub mod prompt;
pub mod relay;
pub mod remote;
pub mod routes;
pub mod session;
pub mod state;
pub mod supervisor;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use bridge::Bridge;
pub use config::Config;
pub use monitor::{LivenessMonitor, MonitorExit};
pub use relay::{CommandRelay, RelayCommand};
pub use session::{AuthSession, SessionState};
pub use state::AppState;
