//! The bridge facade: one device, one session, one busy flag.
//!
//! [`Bridge`] owns the shared pieces and hands out the components built on
//! them. Local callers (the HTTP API, the startup prompt) go through the
//! typed operations here; the control server goes through
//! [`Bridge::serve_remote`]. Both paths end in the same [`CommandRelay`],
//! so they share the authentication gate, the busy flag and the error
//! semantics.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::device::{CommandProtocol, DeviceTransport};
use crate::handshake::{HandshakeError, ServerHandshake};
use crate::monitor::LivenessMonitor;
use crate::relay::{BusyFlag, CommandRelay, RelayCommand, RelayError, RelayExit};
use crate::remote::RemoteConnection;
use crate::session::{AuthSession, SessionError, SessionState};

#[derive(Clone)]
pub struct Bridge {
    transport: DeviceTransport,
    protocol: CommandProtocol,
    session: AuthSession,
    relay: CommandRelay,
    remote_shutdown: CancellationToken,
    verdict_timeout: Duration,
}

impl Bridge {
    #[must_use]
    pub fn new(transport: DeviceTransport, command_timeout: Duration, verdict_timeout: Duration) -> Self {
        let protocol = CommandProtocol::new(transport.clone(), command_timeout);
        let session = AuthSession::new(protocol.clone());
        let relay = CommandRelay::new(session.clone(), protocol.clone(), BusyFlag::new());
        Self {
            transport,
            protocol,
            session,
            relay,
            remote_shutdown: CancellationToken::new(),
            verdict_timeout,
        }
    }

    #[must_use]
    pub fn transport(&self) -> &DeviceTransport {
        &self.transport
    }

    #[must_use]
    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    #[must_use]
    pub fn busy(&self) -> &BusyFlag {
        self.relay.busy()
    }

    /// Cancelled when the remote side of the bridge must stop.
    #[must_use]
    pub fn remote_shutdown(&self) -> &CancellationToken {
        &self.remote_shutdown
    }

    /// A liveness monitor sharing this bridge's transport, busy flag and
    /// remote shutdown token. Interval and threshold are set by the caller.
    #[must_use]
    pub fn monitor(&self) -> LivenessMonitor {
        LivenessMonitor::new(
            self.protocol.clone(),
            self.relay.busy().clone(),
            self.remote_shutdown.clone(),
        )
    }

    #[must_use]
    pub fn handshake(&self) -> ServerHandshake {
        ServerHandshake::new(self.protocol.clone(), self.verdict_timeout)
    }

    pub async fn authenticate(&self, password: &str) -> Result<(), SessionError> {
        self.session.submit(password).await
    }

    pub async fn logout(&self) -> Result<(), RelayError> {
        self.relay.dispatch(RelayCommand::Logout).await.map(drop)
    }

    pub async fn get_req_nft(&self) -> Result<String, RelayError> {
        self.relay.dispatch(RelayCommand::GetReqNft).await
    }

    pub async fn get_auth_nft(&self) -> Result<String, RelayError> {
        self.relay.dispatch(RelayCommand::GetAuthNft).await
    }

    pub async fn set_req_nft(&self, nft: &str) -> Result<String, RelayError> {
        self.relay
            .dispatch(RelayCommand::SetReqNft(nft.to_string()))
            .await
    }

    pub async fn set_auth_nft(&self, nft: &str) -> Result<String, RelayError> {
        self.relay
            .dispatch(RelayCommand::SetAuthNft(nft.to_string()))
            .await
    }

    pub async fn sign_req(&self, msg: &str) -> Result<String, RelayError> {
        self.relay
            .dispatch(RelayCommand::SignReqMsg(msg.to_string()))
            .await
    }

    pub async fn sign_auth(&self, msg: &str) -> Result<String, RelayError> {
        self.relay
            .dispatch(RelayCommand::SignAuthMsg(msg.to_string()))
            .await
    }

    pub async fn remove_req(&self) -> Result<String, RelayError> {
        self.relay.dispatch(RelayCommand::RemoveReqNft).await
    }

    pub async fn remove_auth(&self) -> Result<String, RelayError> {
        self.relay.dispatch(RelayCommand::RemoveAuthNft).await
    }

    pub async fn get_req_addr(&self) -> Result<String, RelayError> {
        self.relay.dispatch(RelayCommand::GetReqAddr).await
    }

    pub async fn get_auth_addr(&self) -> Result<String, RelayError> {
        self.relay.dispatch(RelayCommand::GetAuthAddr).await
    }

    /// Handshake with the control server, then relay its commands.
    ///
    /// Returns once the server closes the connection or the remote
    /// shutdown token fires. The connection is closed on every path.
    pub async fn serve_remote<S>(
        &self,
        conn: &mut RemoteConnection<S>,
    ) -> Result<RelayExit, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = self.handshake();
        let validated = tokio::select! {
            () = self.remote_shutdown.cancelled() => None,
            result = handshake.run(&self.session, conn) => Some(result),
        };
        match validated {
            Some(result) => {
                result?;
            }
            None => {
                info!("Bridge: shutdown during handshake");
                conn.close().await;
                return Ok(RelayExit::Cancelled);
            }
        }
        Ok(self.relay.serve(conn, &self.remote_shutdown).await)
    }

    /// Stop the remote side and close the device. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.remote_shutdown.cancel();
        if self.transport.close().await {
            info!(port = %self.transport.port(), "Bridge: shut down");
        }
    }
}
