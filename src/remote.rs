//! Line-framed connection to the control server.
//!
//! Generic over the byte stream so the handshake and relay can be driven by
//! an in-memory duplex in tests; production uses [`TcpStream`].

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info};

/// Longest line accepted from the server.
const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line exceeds maximum length")]
    LineTooLong,
    #[error("connection is closed")]
    Closed,
}

impl From<LinesCodecError> for RemoteError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => Self::LineTooLong,
            LinesCodecError::Io(e) => Self::Io(e),
        }
    }
}

/// Newline-delimited text connection to the control server.
pub struct RemoteConnection<S = TcpStream> {
    framed: Framed<S, LinesCodec>,
    peer: String,
    closed: bool,
}

impl RemoteConnection<TcpStream> {
    /// Connect to `addr` (`host:port`).
    pub async fn connect(addr: &str) -> Result<Self, RemoteError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| RemoteError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        info!(server = %addr, "Remote: connected to control server");
        Ok(Self::new(stream, addr))
    }
}

impl<S> RemoteConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN)),
            peer: peer.into(),
            closed: false,
        }
    }

    /// Server address, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send one line; the codec appends the newline.
    pub async fn send_line(&mut self, line: &str) -> Result<(), RemoteError> {
        if self.closed {
            return Err(RemoteError::Closed);
        }
        self.framed.send(line).await?;
        debug!(peer = %self.peer, "Remote: sent {} bytes", line.len() + 1);
        Ok(())
    }

    /// Next line from the server, `None` at end of stream. Cancel-safe.
    pub async fn recv_line(&mut self) -> Result<Option<String>, RemoteError> {
        if self.closed {
            return Err(RemoteError::Closed);
        }
        match self.framed.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Flush and shut down the write side. Only the first call has an effect.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = SinkExt::<&str>::close(&mut self.framed).await;
        info!(peer = %self.peer, "Remote: connection closed");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    #[tokio::test]
    async fn test_send_and_receive_lines() {
        let (client, server) = tokio::io::duplex(256);
        let mut conn = RemoteConnection::new(client, "test");
        let (read_half, mut write_half) = tokio::io::split(server);

        conn.send_line("0xabc,0xdef").await.unwrap();
        let mut lines = BufReader::new(read_half).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "0xabc,0xdef");

        write_half.write_all(b"VALIDATED\r\ngetreqnft\n").await.unwrap();
        assert_eq!(conn.recv_line().await.unwrap().unwrap(), "VALIDATED");
        assert_eq!(conn.recv_line().await.unwrap().unwrap(), "getreqnft");
    }

    #[tokio::test]
    async fn test_recv_none_at_eof() {
        let (client, server) = tokio::io::duplex(64);
        let mut conn = RemoteConnection::new(client, "test");
        drop(server);
        assert!(conn.recv_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, server) = tokio::io::duplex(64);
        let mut conn = RemoteConnection::new(client, "test");
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(matches!(conn.send_line("x").await, Err(RemoteError::Closed)));

        let mut lines = BufReader::new(server).lines();
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let (client, mut server) = tokio::io::duplex(MAX_LINE_LEN * 2);
        let mut conn = RemoteConnection::new(client, "test");
        let long = vec![b'a'; MAX_LINE_LEN + 10];
        server.write_all(&long).await.unwrap();
        server.write_all(b"\n").await.unwrap();
        assert!(matches!(conn.recv_line().await, Err(RemoteError::LineTooLong)));
    }
}
