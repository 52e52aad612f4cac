//! Password-authenticated device session.
//!
//! ```text
//! Unauthenticated ──submit──▶ Authenticating ──PASSWORD_OK──▶ Authenticated
//!        ▲                         │                              │
//!        └──── FAIL / timeout ─────┘                              │ logout ("Logged out")
//!                                  │ transport error              ▼
//!                                  ▼                          LoggedOut
//!                                Failed
//! ```
//!
//! State is published through a `watch` channel: the session is the only
//! writer, the relay and the HTTP health route read it.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::device::command::{LOGGED_OUT, PASSWORD_OK};
use crate::device::{CommandProtocol, DeviceCommand, DeviceError};

/// Where the device session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    LoggedOut,
    /// The device became unreachable mid-handshake. Terminal.
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::LoggedOut => "logged_out",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("operation not allowed while session is {0}")]
    InvalidState(SessionState),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// The one authentication session for the attached device.
#[derive(Clone)]
pub struct AuthSession {
    protocol: CommandProtocol,
    state: Arc<watch::Sender<SessionState>>,
}

impl AuthSession {
    #[must_use]
    pub fn new(protocol: CommandProtocol) -> Self {
        let (tx, _rx) = watch::channel(SessionState::Unauthenticated);
        Self {
            protocol,
            state: Arc::new(tx),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    fn set(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "Session: state changed");
        }
    }

    /// Send the password to the device.
    ///
    /// Only an exact `PASSWORD_OK` reply authenticates. A second submit while
    /// one is in flight, or once authenticated, is refused without touching
    /// the device.
    pub async fn submit(&self, password: &str) -> Result<(), SessionError> {
        if password.is_empty() {
            return Err(SessionError::EmptyPassword);
        }

        let claimed = self.state.send_if_modified(|state| match state {
            SessionState::Unauthenticated | SessionState::LoggedOut => {
                *state = SessionState::Authenticating;
                true
            }
            _ => false,
        });
        if !claimed {
            return Err(SessionError::InvalidState(self.state()));
        }
        info!("Session: authenticating with device");

        match self
            .protocol
            .execute(&DeviceCommand::Pass(password.to_string()))
            .await
        {
            Ok(reply) if reply == PASSWORD_OK => {
                self.set(SessionState::Authenticated);
                info!("Session: authentication successful");
                Ok(())
            }
            Ok(reply) => {
                self.set(SessionState::Unauthenticated);
                warn!(reply = %reply, "Session: authentication rejected by device");
                Err(DeviceError::ProtocolMismatch {
                    expected: PASSWORD_OK.to_string(),
                    got: reply,
                }
                .into())
            }
            Err(e) if e.is_fatal() => {
                self.set(SessionState::Failed);
                Err(e.into())
            }
            Err(e) => {
                self.set(SessionState::Unauthenticated);
                Err(e.into())
            }
        }
    }

    /// Lock the device again.
    ///
    /// Only an exact `Logged out` reply moves the session to `LoggedOut`; any
    /// other reply or a timeout leaves it `Authenticated`.
    pub async fn logout(&self) -> Result<(), SessionError> {
        let current = self.state();
        if current != SessionState::Authenticated {
            return Err(SessionError::InvalidState(current));
        }

        match self.protocol.execute(&DeviceCommand::Logout).await {
            Ok(reply) if reply == LOGGED_OUT => {
                self.state.send_if_modified(|state| {
                    if *state == SessionState::Authenticated {
                        *state = SessionState::LoggedOut;
                        true
                    } else {
                        false
                    }
                });
                info!("Session: logged out");
                Ok(())
            }
            Ok(reply) => {
                warn!(reply = %reply, "Session: logout not confirmed, staying authenticated");
                Err(DeviceError::ProtocolMismatch {
                    expected: LOGGED_OUT.to_string(),
                    got: reply,
                }
                .into())
            }
            Err(e) if e.is_fatal() => {
                self.set(SessionState::Failed);
                Err(e.into())
            }
            Err(e) => {
                warn!("Session: logout failed ({e}), staying authenticated");
                Err(e.into())
            }
        }
    }
}
