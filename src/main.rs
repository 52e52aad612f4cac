#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # swbridge
//!
//! Bridge between a SecureWallet hardware device on a serial port and a
//! remote control server.
//!
//! The bridge opens the device, asks for the wallet password, authenticates,
//! sends the device's two public addresses to the control server and, once
//! the server answers `VALIDATED`, relays the server's commands to the device
//! one line at a time. A background monitor tears everything down if the
//! device disappears, and an optional local HTTP API exposes the same
//! operations to local callers.
//!
//! ## Subcommands
//!
//! - `swbridge serve` (default): run the bridge
//! - `swbridge supervise`: run the bridge as a child and restart it on failure
//! - `swbridge ports`: list serial ports that look like the wallet
//!
//! ## Exit codes
//!
//! | Code | Meaning                                                     |
//! |------|-------------------------------------------------------------|
//! | 0    | clean stop: signal, no password, server closed the session  |
//! | 1    | fatal startup or session error                              |
//! | 2    | device lost (liveness monitor)                              |
//!
//! ## HTTP API
//!
//! | Method | Path                              | Description                 |
//! |--------|-----------------------------------|-----------------------------|
//! | GET    | `/health`                         | Bridge status (no auth)     |
//! | POST   | `/authenticate`                   | Unlock the device           |
//! | POST   | `/logout`                         | Lock the device             |
//! | GET    | `/getreqnft`, `/getauthnft`       | Read stored NFT             |
//! | POST   | `/setreqnft`, `/setauthnft`       | Store NFT                   |
//! | POST   | `/signreqnft`, `/signauthnft`     | Sign a message              |
//! | POST   | `/removereqnft`, `/removeauthnft` | Remove stored NFT           |
//! | GET    | `/getreqaddr`, `/getauthaddr`     | Public address              |

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use swbridge::device::serial::SerialPort;
use swbridge::device::DeviceTransport;
use swbridge::prompt::{DefaultPassword, PasswordSource};
use swbridge::relay::RelayExit;
use swbridge::remote::RemoteConnection;
use swbridge::session::SessionError;
use swbridge::{discovery, routes, supervisor};
use swbridge::{AppState, Bridge, Config, MonitorExit, SessionState};

const EXIT_FATAL: i32 = 1;
const EXIT_DEVICE_LOST: i32 = 2;

/// SecureWallet device bridge.
#[derive(Parser)]
#[command(name = "swbridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run as supervisor: starts the bridge and restarts it on failure.
    Supervise {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// List serial ports that look like a SecureWallet.
    Ports,
}

/// How the foreground session ended.
enum Outcome {
    /// Server closed the relay, the user gave no password, or we were asked to stop.
    Clean,
    Fatal,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Some(Commands::Supervise { config }) => run_supervisor_mode(config.as_deref()).await,
        Some(Commands::Serve { config }) => run_bridge(config.as_deref()).await,
        Some(Commands::Ports) => list_ports(),
        None => run_bridge(None).await,
    };
    // A terminal prompt may still be blocked on stdin.
    std::process::exit(code);
}

fn load_config(config_path: Option<&str>) -> Option<Config> {
    match Config::load(config_path) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("swbridge: {e}");
            None
        }
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

fn list_ports() -> i32 {
    let ports = discovery::list_candidate_ports(Path::new(discovery::DEV_DIR));
    if ports.is_empty() {
        println!("No USB serial ports found");
    }
    for port in &ports {
        println!("{}", port.display());
    }
    if let Some(port) = discovery::find_device_port() {
        println!("Selected: {port}");
    }
    0
}

async fn run_supervisor_mode(config_path: Option<&str>) -> i32 {
    let Some(config) = load_config(config_path) else {
        return EXIT_FATAL;
    };
    init_tracing(&config);

    info!("swbridge supervisor starting");
    match supervisor::run_supervisor(config_path, &config.supervisor).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Supervisor failed: {e}");
            EXIT_FATAL
        }
    }
}

async fn run_bridge(config_path: Option<&str>) -> i32 {
    let Some(config) = load_config(config_path) else {
        return EXIT_FATAL;
    };
    init_tracing(&config);
    info!("swbridge v{} starting", env!("CARGO_PKG_VERSION"));

    let stop = CancellationToken::new();
    spawn_signal_listener(stop.clone());

    let port = match config.device.port.clone() {
        Some(port) => port,
        None => match discovery::wait_for_device(discovery::DEFAULT_POLL, &stop).await {
            Some(port) => port,
            None => return 0,
        },
    };

    let serial = match SerialPort::open(&port, config.device.baud_rate) {
        Ok(serial) => serial,
        Err(e) => {
            error!(port = %port, "Failed to open device: {e}");
            return EXIT_FATAL;
        }
    };
    let transport = DeviceTransport::new(serial, &port, config.device.read_timeout());
    let bridge = Bridge::new(
        transport,
        config.device.command_timeout(),
        config.server.verdict_timeout(),
    );
    let config = Arc::new(config);

    let monitor = config.monitor.enabled.then(|| {
        bridge
            .monitor()
            .interval(config.monitor.interval())
            .max_failures(config.monitor.max_failures)
            .status_refresh(config.monitor.status_refresh)
    });
    let monitor_stats = monitor.as_ref().map(|m| m.stats());
    let monitor_task = monitor.map(|m| m.spawn(stop.child_token()));

    let api_task = if config.api.enabled {
        let state = AppState::new(bridge.clone(), Arc::clone(&config), monitor_stats);
        match spawn_api(state, &config.api.listen, stop.clone()).await {
            Ok(task) => Some(task),
            Err(e) => {
                error!(listen = %config.api.listen, "Failed to start HTTP API: {e}");
                stop.cancel();
                bridge.shutdown().await;
                return EXIT_FATAL;
            }
        }
    } else {
        None
    };
    if config.api.enabled && config.api.api_key.is_none() {
        warn!("HTTP API has no api_key, any local process can use the wallet session");
    }

    let outcome = tokio::select! {
        outcome = run_session(&bridge, &config) => outcome,
        () = bridge.remote_shutdown().cancelled() => Outcome::Clean,
        () = stop.cancelled() => Outcome::Clean,
    };

    // Cleanup
    info!("Shutting down...");
    stop.cancel();
    let device_lost = match monitor_task {
        Some(task) => match task.await {
            Ok(exit) => matches!(exit, MonitorExit::DeviceLost { .. }),
            Err(e) => {
                error!("Liveness monitor task failed: {e}");
                false
            }
        },
        None => false,
    };
    bridge.shutdown().await;
    if let Some(task) = api_task {
        let _ = task.await;
    }

    info!("Goodbye");
    match outcome {
        _ if device_lost => EXIT_DEVICE_LOST,
        Outcome::Clean => 0,
        Outcome::Fatal => EXIT_FATAL,
    }
}

/// Connect to the control server, authenticate, then serve it.
async fn run_session(bridge: &Bridge, config: &Config) -> Outcome {
    let mut conn = match RemoteConnection::connect(&config.server.addr).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Could not connect to the control server: {e}");
            return Outcome::Fatal;
        }
    };

    let password = match tokio::task::spawn_blocking(|| DefaultPassword::default().password()).await {
        Ok(Ok(Some(password))) => password,
        Ok(Ok(None)) => {
            info!("No password entered, exiting");
            conn.close().await;
            return Outcome::Clean;
        }
        Ok(Err(e)) => {
            error!("Password prompt failed: {e}");
            return Outcome::Fatal;
        }
        Err(e) => {
            error!("Password prompt task failed: {e}");
            return Outcome::Fatal;
        }
    };

    match bridge.authenticate(&password).await {
        Ok(()) => {}
        Err(SessionError::InvalidState(SessionState::Authenticated)) => {
            info!("Device already unlocked through the HTTP API");
        }
        Err(e) => {
            warn!("Authentication failed: {e}");
            conn.close().await;
            return Outcome::Fatal;
        }
    }
    drop(password);

    match bridge.serve_remote(&mut conn).await {
        Ok(RelayExit::Closed | RelayExit::Cancelled) => Outcome::Clean,
        Ok(RelayExit::Failed(e)) => {
            error!("Control server connection failed: {e}");
            Outcome::Fatal
        }
        Err(e) => {
            error!("Server handshake failed: {e}");
            Outcome::Fatal
        }
    }
}

async fn spawn_api(
    state: AppState,
    listen: &str,
    stop: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(listen).await?;
    info!("HTTP API listening on {listen}");
    let app = routes::router(state);
    Ok(tokio::spawn(async move {
        let shutdown = async move { stop.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("HTTP API error: {e}");
        }
    }))
}

/// Cancel `stop` on SIGINT or SIGTERM.
fn spawn_signal_listener(stop: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        stop.cancel();
    });
}
