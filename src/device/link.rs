//! Exclusive, line-oriented access to the device.
//!
//! A [`SerialLink`] is the raw handle: blocking writes and deadline-bounded
//! line reads. [`DeviceTransport`] wraps one link behind a single
//! `tokio::sync::Mutex` that every wire user (command protocol, liveness
//! monitor) must hold for the whole of one logical exchange. The blocking I/O
//! runs on a `spawn_blocking` thread that owns the lock guard, so tasks
//! waiting for the device never stall a runtime worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::DeviceError;

/// Blocking, line-based access to the physical device.
pub trait SerialLink: Send {
    /// Write raw bytes to the device.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for one complete newline-terminated line.
    ///
    /// Returns the trimmed line, or `None` if no complete line arrived in
    /// time. Partial input is kept for the next call.
    fn receive_line(&mut self, timeout: Duration) -> Result<Option<String>, DeviceError>;

    /// Cheap presence check that does not touch the command channel.
    fn is_present(&mut self) -> bool;

    /// Release the underlying handle.
    fn close(&mut self);

    /// Send one request line, newline-terminated.
    fn send_line(&mut self, line: &str) -> Result<(), DeviceError> {
        let mut frame = String::with_capacity(line.len() + 1);
        frame.push_str(line);
        frame.push('\n');
        self.write_all(frame.as_bytes())
    }
}

struct LinkSlot {
    link: Box<dyn SerialLink>,
    closed: bool,
}

/// Cloneable handle to the one device link; clones share the lock.
#[derive(Clone)]
pub struct DeviceTransport {
    slot: Arc<Mutex<LinkSlot>>,
    port: Arc<str>,
    read_timeout: Duration,
}

impl DeviceTransport {
    /// Wrap an open link. `read_timeout` bounds each individual read.
    pub fn new(link: impl SerialLink + 'static, port: &str, read_timeout: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(LinkSlot {
                link: Box::new(link),
                closed: false,
            })),
            port: Arc::from(port),
            read_timeout,
        }
    }

    /// Device path this transport was opened on.
    #[must_use]
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Upper bound for a single blocking read.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Run one logical exchange with exclusive access to the link.
    ///
    /// The lock is held from before the first write until `f` returns, so no
    /// other exchange can interleave on the wire.
    pub async fn exchange<F, T>(&self, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce(&mut dyn SerialLink) -> Result<T, DeviceError> + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = Arc::clone(&self.slot).lock_owned().await;
        if guard.closed {
            return Err(DeviceError::Closed);
        }
        tokio::task::spawn_blocking(move || f(guard.link.as_mut()))
            .await
            .map_err(|e| DeviceError::Transport(format!("device I/O task failed: {e}")))?
    }

    /// Presence probe under the transport lock. A closed transport is absent.
    pub async fn probe(&self) -> bool {
        self.exchange(|link| Ok(link.is_present()))
            .await
            .unwrap_or(false)
    }

    /// Close the link. Returns `true` only for the call that actually closed it.
    pub async fn close(&self) -> bool {
        let mut guard = self.slot.lock().await;
        if guard.closed {
            debug!(port = %self.port, "Device: close requested, already closed");
            return false;
        }
        guard.closed = true;
        guard.link.close();
        info!(port = %self.port, "Device: connection closed");
        true
    }

    /// Whether [`close`](Self::close) has run.
    pub async fn is_closed(&self) -> bool {
        self.slot.lock().await.closed
    }
}
