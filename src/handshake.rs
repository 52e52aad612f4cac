//! Post-authentication address exchange with the control server.
//!
//! The bridge reads the device's two public addresses (request identity and
//! auth identity), sends them as `"<req>,<auth>\n"`, and waits for a verdict
//! line. `VALIDATED` enables the relay, `RETRY` means "keep waiting" (nothing
//! is resent), anything else is a rejection. Each wait for a verdict line is
//! bounded; the bound restarts after every `RETRY`.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::device::{CommandProtocol, DeviceCommand, DeviceError};
use crate::remote::{RemoteConnection, RemoteError};
use crate::session::AuthSession;

/// Default bound for one verdict wait.
pub const DEFAULT_VERDICT_TIMEOUT: Duration = Duration::from_secs(30);

/// The device's two public addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPair {
    pub request: String,
    pub auth: String,
}

impl AddressPair {
    /// The line sent to the server, without the newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{},{}", self.request, self.auth)
    }
}

/// A server reply during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Validated,
    Retry,
    Other(String),
}

impl Verdict {
    #[must_use]
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "VALIDATED" => Self::Validated,
            "RETRY" => Self::Retry,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("session is not authenticated")]
    NotAuthenticated,
    #[error("reading device address failed: {0}")]
    Address(#[source] DeviceError),
    #[error("server rejected addresses: {0:?}")]
    Rejected(String),
    #[error("no verdict from server within {}s", .0.as_secs())]
    VerdictTimeout(Duration),
    #[error("server closed the connection during handshake")]
    Closed,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Runs the address exchange on a fresh remote connection.
pub struct ServerHandshake {
    protocol: CommandProtocol,
    verdict_timeout: Duration,
}

impl ServerHandshake {
    #[must_use]
    pub fn new(protocol: CommandProtocol, verdict_timeout: Duration) -> Self {
        Self {
            protocol,
            verdict_timeout,
        }
    }

    /// Read both addresses from the device.
    pub async fn read_addresses(&self) -> Result<AddressPair, HandshakeError> {
        let request = self
            .protocol
            .execute(&DeviceCommand::GetAddrReq)
            .await
            .map_err(HandshakeError::Address)?;
        let auth = self
            .protocol
            .execute(&DeviceCommand::GetAddrAuth)
            .await
            .map_err(HandshakeError::Address)?;
        Ok(AddressPair { request, auth })
    }

    /// Exchange addresses and wait for `VALIDATED`.
    ///
    /// On any failure the connection is closed before returning.
    pub async fn run<S>(
        &self,
        session: &AuthSession,
        conn: &mut RemoteConnection<S>,
    ) -> Result<AddressPair, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.exchange(session, conn).await;
        if let Err(e) = &result {
            warn!(peer = %conn.peer(), "Handshake: failed: {e}");
            conn.close().await;
        }
        result
    }

    async fn exchange<S>(
        &self,
        session: &AuthSession,
        conn: &mut RemoteConnection<S>,
    ) -> Result<AddressPair, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !session.is_authenticated() {
            return Err(HandshakeError::NotAuthenticated);
        }

        let addresses = self.read_addresses().await?;
        conn.send_line(&addresses.to_line()).await?;
        info!(
            request = %addresses.request,
            auth = %addresses.auth,
            "Handshake: addresses sent to server"
        );

        loop {
            let line = tokio::time::timeout(self.verdict_timeout, conn.recv_line())
                .await
                .map_err(|_| HandshakeError::VerdictTimeout(self.verdict_timeout))??;
            let Some(line) = line else {
                return Err(HandshakeError::Closed);
            };

            match Verdict::parse(&line) {
                Verdict::Validated => {
                    info!("Handshake: addresses validated by server");
                    return Ok(addresses);
                }
                Verdict::Retry => {
                    warn!("Handshake: server requested retry, waiting for further instructions");
                }
                Verdict::Other(reply) => return Err(HandshakeError::Rejected(reply)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::device::command::PASSWORD_OK;
    use crate::device::mock::MockDevice;
    use crate::device::DeviceTransport;

    fn wallet(addresses: bool) -> MockDevice {
        MockDevice::new(move |line| match line {
            "GET_ADDR_REQ" if addresses => Some("0xREQ".into()),
            "GET_ADDR_AUTH" if addresses => Some("0xAUTH".into()),
            _ if line.starts_with("PASS ") => Some(PASSWORD_OK.into()),
            _ => None,
        })
    }

    async fn setup(device: &MockDevice, verdict_timeout: Duration) -> (AuthSession, ServerHandshake) {
        let transport = DeviceTransport::new(device.link(), "mock", Duration::from_millis(20));
        let protocol = CommandProtocol::new(transport, Duration::from_millis(150));
        let session = AuthSession::new(protocol.clone());
        session.submit("pw").await.unwrap();
        (session, ServerHandshake::new(protocol, verdict_timeout))
    }

    #[test]
    fn test_verdict_parse() {
        assert_eq!(Verdict::parse("VALIDATED\r"), Verdict::Validated);
        assert_eq!(Verdict::parse("RETRY"), Verdict::Retry);
        assert_eq!(
            Verdict::parse("VALIDATED!"),
            Verdict::Other("VALIDATED!".into())
        );
    }

    #[tokio::test]
    async fn test_validated_after_retry() {
        let device = wallet(true);
        let (session, handshake) = setup(&device, Duration::from_secs(2)).await;
        let (client, server) = tokio::io::duplex(256);
        let mut conn = RemoteConnection::new(client, "test");

        let server_task = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server);
            let mut lines = BufReader::new(read_half).lines();
            let sent = lines.next_line().await.unwrap().unwrap();
            write_half.write_all(b"RETRY\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            write_half.write_all(b"VALIDATED\n").await.unwrap();
            // Nothing is resent after RETRY.
            let extra = tokio::time::timeout(Duration::from_millis(50), lines.next_line()).await;
            (sent, extra.is_err(), lines, write_half)
        });

        let addresses = handshake.run(&session, &mut conn).await.unwrap();
        assert_eq!(
            addresses,
            AddressPair {
                request: "0xREQ".into(),
                auth: "0xAUTH".into()
            }
        );
        let (sent, nothing_resent, _lines, _write) = server_task.await.unwrap();
        assert_eq!(sent, "0xREQ,0xAUTH");
        assert!(nothing_resent);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_closes_connection() {
        let device = wallet(true);
        let (session, handshake) = setup(&device, Duration::from_secs(2)).await;
        let (client, server) = tokio::io::duplex(256);
        let mut conn = RemoteConnection::new(client, "test");

        let (read_half, mut write_half) = tokio::io::split(server);
        write_half.write_all(b"DENIED\n").await.unwrap();

        let err = handshake.run(&session, &mut conn).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Rejected(ref r) if r == "DENIED"));
        assert!(conn.is_closed());

        let mut lines = BufReader::new(read_half).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "0xREQ,0xAUTH");
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_verdict_timeout() {
        let device = wallet(true);
        let (session, handshake) = setup(&device, Duration::from_millis(80)).await;
        let (client, _server) = tokio::io::duplex(256);
        let mut conn = RemoteConnection::new(client, "test");

        let err = handshake.run(&session, &mut conn).await.unwrap_err();
        assert!(matches!(err, HandshakeError::VerdictTimeout(_)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_server_eof() {
        let device = wallet(true);
        let (session, handshake) = setup(&device, Duration::from_secs(1)).await;
        let (client, server) = tokio::io::duplex(256);
        let mut conn = RemoteConnection::new(client, "test");
        drop(server);

        let err = handshake.run(&session, &mut conn).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Closed | HandshakeError::Remote(_)
        ));
    }

    #[tokio::test]
    async fn test_address_failure_aborts_before_sending() {
        let device = wallet(false);
        let (session, handshake) = setup(&device, Duration::from_secs(1)).await;
        let (client, server) = tokio::io::duplex(256);
        let mut conn = RemoteConnection::new(client, "test");

        let err = handshake.run(&session, &mut conn).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Address(DeviceError::Timeout(_))
        ));
        let mut lines = BufReader::new(server).lines();
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_requires_authenticated_session() {
        let device = wallet(true);
        let transport = DeviceTransport::new(device.link(), "mock", Duration::from_millis(20));
        let protocol = CommandProtocol::new(transport, Duration::from_millis(150));
        let session = AuthSession::new(protocol.clone());
        let handshake = ServerHandshake::new(protocol, Duration::from_secs(1));
        let (client, _server) = tokio::io::duplex(256);
        let mut conn = RemoteConnection::new(client, "test");

        let err = handshake.run(&session, &mut conn).await.unwrap_err();
        assert!(matches!(err, HandshakeError::NotAuthenticated));
        assert!(device.written().is_empty());
    }
}
