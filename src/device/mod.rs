//! SecureWallet device access.
//!
//! - [`link`]: the [`SerialLink`] trait and the lock-guarded [`DeviceTransport`]
//! - [`serial`]: native termios implementation of [`SerialLink`]
//! - [`command`]: the closed [`DeviceCommand`] set and its wire encoding
//! - [`protocol`]: request/response exchange with a bounded deadline

use std::time::Duration;

pub mod command;
pub mod link;
pub mod protocol;
pub mod serial;

#[cfg(test)]
pub(crate) mod mock;

pub use command::DeviceCommand;
pub use link::{DeviceTransport, SerialLink};
pub use protocol::CommandProtocol;

/// Errors raised while talking to the device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Open, read or write on the serial handle failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// No reply line arrived before the deadline.
    #[error("no response from device within {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),
    /// The device answered a strict-match command with something else.
    #[error("unexpected device reply: expected {expected:?}, got {got:?}")]
    ProtocolMismatch { expected: String, got: String },
    /// The command could not be encoded on the wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The device handle has already been closed.
    #[error("device handle is closed")]
    Closed,
}

impl DeviceError {
    /// Whether this error means the device itself is unreachable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Closed)
    }
}
