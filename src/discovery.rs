//! Serial port discovery for the SecureWallet.
//!
//! Linux exposes a descriptive symlink per USB serial device under
//! `/dev/serial/by-id` (vendor and product strings are part of the name);
//! those are checked first for `USB`, `ESP32` or `CDC`. Otherwise the first
//! USB-serial style node in `/dev` is used.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEV_DIR: &str = "/dev";
const BY_ID_DIR: &str = "/dev/serial/by-id";

/// Device node name prefixes of USB serial adapters (Linux and macOS).
const PORT_PREFIXES: &[&str] = &[
    "ttyUSB",
    "ttyACM",
    "cu.usbserial",
    "cu.usbmodem",
    "cu.SLAB_USBtoUART",
    "cu.wchusbserial",
];

/// Substrings of a by-id name that identify the wallet's USB bridge.
const DESCRIPTION_HINTS: &[&str] = &["USB", "ESP32", "CDC"];

/// Default interval between scans while waiting for the device.
pub const DEFAULT_POLL: Duration = Duration::from_secs(2);

/// USB serial device nodes in `dir`, sorted by path.
#[must_use]
pub fn list_candidate_ports(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut ports: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            PORT_PREFIXES.iter().any(|p| name.starts_with(p))
        })
        .map(|entry| entry.path())
        .collect();
    ports.sort();
    ports
}

/// By-id links whose name carries one of the description hints, resolved
/// to their device node.
fn described_ports(by_id: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(by_id) else {
        return Vec::new();
    };
    let mut ports: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            DESCRIPTION_HINTS.iter().any(|h| name.contains(h))
        })
        .filter_map(|entry| std::fs::canonicalize(entry.path()).ok())
        .collect();
    ports.sort();
    ports
}

fn find_in(dev: &Path, by_id: &Path) -> Option<String> {
    described_ports(by_id)
        .into_iter()
        .chain(list_candidate_ports(dev))
        .next()
        .map(|p| p.to_string_lossy().into_owned())
}

/// First port that looks like the wallet, if any is plugged in.
#[must_use]
pub fn find_device_port() -> Option<String> {
    find_in(Path::new(DEV_DIR), Path::new(BY_ID_DIR))
}

/// Poll every `poll` until a device port appears. `None` if `stop` fires first.
pub async fn wait_for_device(poll: Duration, stop: &CancellationToken) -> Option<String> {
    info!("Discovery: waiting for SecureWallet device to be plugged in");
    loop {
        if let Some(port) = find_device_port() {
            info!(port = %port, "Discovery: device detected");
            return Some(port);
        }
        debug!("Discovery: no device yet");
        tokio::select! {
            () = stop.cancelled() => return None,
            () = tokio::time::sleep(poll) => {}
        }
    }
}
