//! Command relay: inbound text commands → device operations.
//!
//! Inbound lines look like `<command> [argument]`. The first whitespace
//! separated token selects a [`RelayCommand`]; everything after it is the
//! argument. Every command requires an authenticated session and runs with
//! the [`BusyFlag`] raised so the liveness monitor stays off the wire.
//!
//! A failing command never ends the relay loop; it becomes an `ERROR: ...`
//! reply line. The loop ends only when the remote connection does, or when
//! the shutdown token fires.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::device::{CommandProtocol, DeviceCommand, DeviceError};
use crate::remote::RemoteConnection;
use crate::session::{AuthSession, SessionError};

/// Reply sent for a successful `logout`.
pub const LOGOUT_OK_REPLY: &str = "OK";

/// Cooperative "a command is on the wire" signal.
///
/// Counts commands in flight, so the HTTP API and the server relay can each
/// hold a guard at once and the flag only drops when the last one finishes.
#[derive(Clone, Default)]
pub struct BusyFlag(Arc<AtomicUsize>);

impl BusyFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire) > 0
    }

    /// Raise the flag until the returned guard is dropped.
    #[must_use]
    pub fn raise(&self) -> BusyGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        BusyGuard(Arc::clone(&self.0))
    }
}

/// Releases one hold on the [`BusyFlag`] on drop, on every exit path.
pub struct BusyGuard(Arc<AtomicUsize>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Commands accepted from the control server and the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCommand {
    Logout,
    GetReqNft,
    GetAuthNft,
    SetReqNft(String),
    SetAuthNft(String),
    SignReqMsg(String),
    SignAuthMsg(String),
    RemoveReqNft,
    RemoveAuthNft,
    GetReqAddr,
    GetAuthAddr,
}

impl RelayCommand {
    /// Parse one inbound line.
    pub fn parse(line: &str) -> Result<Self, RelayError> {
        let line = line.trim();
        let (keyword, arg) = match line.split_once(char::is_whitespace) {
            Some((k, rest)) => (k, Some(rest.trim()).filter(|a| !a.is_empty())),
            None => (line, None),
        };
        let with_arg = |make: fn(String) -> Self| {
            arg.map(|a| make(a.to_string()))
                .ok_or_else(|| RelayError::MissingArgument(keyword.to_string()))
        };

        match keyword {
            "logout" => Ok(Self::Logout),
            "getreqnft" => Ok(Self::GetReqNft),
            "getauthnft" => Ok(Self::GetAuthNft),
            "setreqnft" => with_arg(Self::SetReqNft),
            "setauthnft" => with_arg(Self::SetAuthNft),
            "signreqmsg" => with_arg(Self::SignReqMsg),
            "signauthmsg" => with_arg(Self::SignAuthMsg),
            "removereqnft" => Ok(Self::RemoveReqNft),
            "removeauthnft" => Ok(Self::RemoveAuthNft),
            "getreqaddr" => Ok(Self::GetReqAddr),
            "getauthaddr" => Ok(Self::GetAuthAddr),
            other => Err(RelayError::UnknownCommand(other.to_string())),
        }
    }

    /// Inbound keyword for this command.
    #[must_use]
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::GetReqNft => "getreqnft",
            Self::GetAuthNft => "getauthnft",
            Self::SetReqNft(_) => "setreqnft",
            Self::SetAuthNft(_) => "setauthnft",
            Self::SignReqMsg(_) => "signreqmsg",
            Self::SignAuthMsg(_) => "signauthmsg",
            Self::RemoveReqNft => "removereqnft",
            Self::RemoveAuthNft => "removeauthnft",
            Self::GetReqAddr => "getreqaddr",
            Self::GetAuthAddr => "getauthaddr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid command '{0}'")]
    UnknownCommand(String),
    #[error("Command '{0}' requires an argument")]
    MissingArgument(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Why [`CommandRelay::serve`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayExit {
    /// The server closed the connection.
    Closed,
    /// The shutdown token fired.
    Cancelled,
    /// Reading or writing the connection failed.
    Failed(String),
}

/// Maps [`RelayCommand`]s onto device commands under the auth gate.
#[derive(Clone)]
pub struct CommandRelay {
    session: AuthSession,
    protocol: CommandProtocol,
    busy: BusyFlag,
}

impl CommandRelay {
    #[must_use]
    pub fn new(session: AuthSession, protocol: CommandProtocol, busy: BusyFlag) -> Self {
        Self {
            session,
            protocol,
            busy,
        }
    }

    #[must_use]
    pub fn busy(&self) -> &BusyFlag {
        &self.busy
    }

    /// Run one command against the device and return its textual result.
    pub async fn dispatch(&self, command: RelayCommand) -> Result<String, RelayError> {
        if !self.session.is_authenticated() {
            return Err(RelayError::NotAuthenticated);
        }
        let _busy = self.busy.raise();

        let device_command = match command {
            RelayCommand::Logout => {
                self.session.logout().await?;
                return Ok(LOGOUT_OK_REPLY.to_string());
            }
            RelayCommand::GetReqNft => DeviceCommand::GetNftReq,
            RelayCommand::GetAuthNft => DeviceCommand::GetNftAuth,
            RelayCommand::SetReqNft(nft) => DeviceCommand::SetNftReq(nft),
            RelayCommand::SetAuthNft(nft) => DeviceCommand::SetNftAuth(nft),
            RelayCommand::SignReqMsg(msg) => DeviceCommand::SignMsgReq(msg),
            RelayCommand::SignAuthMsg(msg) => DeviceCommand::SignMsgAuth(msg),
            RelayCommand::RemoveReqNft => DeviceCommand::RemoveNftReq,
            RelayCommand::RemoveAuthNft => DeviceCommand::RemoveNftAuth,
            RelayCommand::GetReqAddr => DeviceCommand::GetAddrReq,
            RelayCommand::GetAuthAddr => DeviceCommand::GetAddrAuth,
        };
        Ok(self.protocol.execute(&device_command).await?)
    }

    /// Handle one inbound line and build the reply. Blank lines get no reply.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let command = match RelayCommand::parse(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Relay: {e}");
                return Some(format!("ERROR: {e}"));
            }
        };

        let keyword = command.keyword();
        match self.dispatch(command).await {
            Ok(result) => {
                info!(command = keyword, "Relay: command executed");
                Some(result)
            }
            Err(RelayError::NotAuthenticated) => {
                warn!(command = keyword, "Relay: rejected, session not authenticated");
                Some(format!("ERROR: {}", RelayError::NotAuthenticated))
            }
            Err(e) => {
                warn!(command = keyword, "Relay: command failed: {e}");
                Some(format!("ERROR: Failed to execute command '{keyword}': {e}"))
            }
        }
    }

    /// Serve commands from `conn` until it closes or `shutdown` fires.
    ///
    /// The connection is closed before this returns.
    pub async fn serve<S>(
        &self,
        conn: &mut RemoteConnection<S>,
        shutdown: &CancellationToken,
    ) -> RelayExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(peer = %conn.peer(), "Relay: serving server commands");
        let exit = loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break RelayExit::Cancelled,
                received = conn.recv_line() => received,
            };
            let line = match received {
                Ok(Some(line)) => line,
                Ok(None) => break RelayExit::Closed,
                Err(e) => break RelayExit::Failed(e.to_string()),
            };
            info!(peer = %conn.peer(), message = %line, "Relay: received message");

            let Some(reply) = self.handle_line(&line).await else {
                continue;
            };
            if let Err(e) = conn.send_line(&reply).await {
                break RelayExit::Failed(e.to_string());
            }
        };

        match &exit {
            RelayExit::Failed(e) => warn!("Relay: connection error: {e}"),
            other => info!("Relay: stopped ({other:?})"),
        }
        conn.close().await;
        exit
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::device::command::{LOGGED_OUT, PASSWORD_OK};
    use crate::device::mock::MockDevice;
    use crate::device::DeviceTransport;

    fn wallet() -> MockDevice {
        MockDevice::new(|line| {
            let reply = match line.split_once(' ') {
                Some(("PASS", "pw")) => PASSWORD_OK.to_string(),
                Some(("PASS", _)) => "FAIL".to_string(),
                Some((kw, arg)) => format!("{kw}:{arg}"),
                None if line == "LOGOUT" => LOGGED_OUT.to_string(),
                None if line == "GET_NFT_AUTH" => return None,
                None => format!("{line}:ok"),
            };
            Some(reply)
        })
    }

    fn relay_for(device: &MockDevice) -> CommandRelay {
        let transport = DeviceTransport::new(device.link(), "mock", Duration::from_millis(20));
        let protocol = CommandProtocol::new(transport, Duration::from_millis(150));
        CommandRelay::new(AuthSession::new(protocol.clone()), protocol, BusyFlag::new())
    }

    async fn authed_relay(device: &MockDevice) -> CommandRelay {
        let relay = relay_for(device);
        relay.session.submit("pw").await.unwrap();
        relay
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(RelayCommand::parse("getreqnft"), Ok(RelayCommand::GetReqNft));
        assert_eq!(RelayCommand::parse(" logout \n"), Ok(RelayCommand::Logout));
        assert_eq!(
            RelayCommand::parse("getauthaddr"),
            Ok(RelayCommand::GetAuthAddr)
        );
    }

    #[test]
    fn test_parse_argument_keeps_inner_spaces() {
        assert_eq!(
            RelayCommand::parse("signreqmsg hello  world"),
            Ok(RelayCommand::SignReqMsg("hello  world".into()))
        );
        assert_eq!(
            RelayCommand::parse("setreqnft nft-1"),
            Ok(RelayCommand::SetReqNft("nft-1".into()))
        );
    }

    #[test]
    fn test_parse_missing_argument() {
        assert_eq!(
            RelayCommand::parse("setauthnft"),
            Err(RelayError::MissingArgument("setauthnft".into()))
        );
        assert_eq!(
            RelayCommand::parse("signauthmsg   "),
            Err(RelayError::MissingArgument("signauthmsg".into()))
        );
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            RelayCommand::parse("bogus arg"),
            Err(RelayError::UnknownCommand("bogus".into()))
        );
        assert_eq!(
            RelayCommand::parse("GETREQNFT"),
            Err(RelayError::UnknownCommand("GETREQNFT".into()))
        );
    }

    #[test]
    fn test_busy_guard_clears_on_drop() {
        let busy = BusyFlag::new();
        assert!(!busy.is_busy());
        {
            let _guard = busy.raise();
            assert!(busy.is_busy());
        }
        assert!(!busy.is_busy());
    }

    #[test]
    fn test_busy_flag_held_until_last_guard_drops() {
        let busy = BusyFlag::new();
        let first = busy.raise();
        let second = busy.raise();
        drop(first);
        assert!(busy.is_busy());
        drop(second);
        assert!(!busy.is_busy());
    }

    #[tokio::test]
    async fn test_dispatch_requires_authentication() {
        let device = wallet();
        let relay = relay_for(&device);
        assert_eq!(
            relay.dispatch(RelayCommand::GetReqNft).await,
            Err(RelayError::NotAuthenticated)
        );
        assert!(device.written().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_maps_each_command() {
        let device = wallet();
        let relay = authed_relay(&device).await;
        let cases = [
            (RelayCommand::GetReqNft, "GET_NFT_REQ:ok"),
            (RelayCommand::SetReqNft("n1".into()), "SET_NFT_REQ:n1"),
            (RelayCommand::SetAuthNft("n2".into()), "SET_NFT_AUTH:n2"),
            (RelayCommand::SignReqMsg("m1".into()), "SIGN_MSG_REQ:m1"),
            (RelayCommand::SignAuthMsg("m2".into()), "SIGN_MSG_AUTH:m2"),
            (RelayCommand::RemoveReqNft, "REMOVE_NFT_REQ:ok"),
            (RelayCommand::RemoveAuthNft, "REMOVE_NFT_AUTH:ok"),
            (RelayCommand::GetReqAddr, "GET_ADDR_REQ:ok"),
            (RelayCommand::GetAuthAddr, "GET_ADDR_AUTH:ok"),
        ];
        for (cmd, expected) in cases {
            assert_eq!(relay.dispatch(cmd).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_dispatch_logout_then_gated() {
        let device = wallet();
        let relay = authed_relay(&device).await;
        assert_eq!(relay.dispatch(RelayCommand::Logout).await.unwrap(), "OK");
        assert_eq!(
            relay.dispatch(RelayCommand::GetReqAddr).await,
            Err(RelayError::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn test_busy_flag_raised_during_command_and_cleared_after_failure() {
        let device = wallet();
        device.set_reply_delay(Duration::from_millis(60));
        let relay = authed_relay(&device).await;
        let busy = relay.busy().clone();

        let task = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.dispatch(RelayCommand::GetReqNft).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(busy.is_busy());
        task.await.unwrap().unwrap();
        assert!(!busy.is_busy());

        // GET_NFT_AUTH never answers: timeout, flag still cleared.
        let err = relay.dispatch(RelayCommand::GetAuthNft).await.unwrap_err();
        assert!(matches!(err, RelayError::Device(DeviceError::Timeout(_))));
        assert!(!busy.is_busy());
    }

    #[tokio::test]
    async fn test_handle_line_replies() {
        let device = wallet();
        let relay = authed_relay(&device).await;
        assert_eq!(relay.handle_line("   ").await, None);
        assert_eq!(
            relay.handle_line("bogus").await.unwrap(),
            "ERROR: Invalid command 'bogus'"
        );
        assert_eq!(
            relay.handle_line("setreqnft").await.unwrap(),
            "ERROR: Command 'setreqnft' requires an argument"
        );
        let reply = relay.handle_line("getauthnft").await.unwrap();
        assert!(
            reply.starts_with("ERROR: Failed to execute command 'getauthnft':"),
            "{reply}"
        );
        assert_eq!(relay.handle_line("getreqaddr").await.unwrap(), "GET_ADDR_REQ:ok");
    }

    #[tokio::test]
    async fn test_handle_line_not_authenticated() {
        let device = wallet();
        let relay = relay_for(&device);
        assert_eq!(
            relay.handle_line("getreqnft").await.unwrap(),
            "ERROR: Not authenticated"
        );
    }

    #[tokio::test]
    async fn test_serve_until_server_closes() {
        let device = wallet();
        let relay = authed_relay(&device).await;
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = RemoteConnection::new(client, "test-server");
        let shutdown = CancellationToken::new();

        let serve = tokio::spawn(async move { relay.serve(&mut conn, &shutdown).await });

        let (read_half, mut write_half) = tokio::io::split(server);
        let mut lines = BufReader::new(read_half).lines();
        write_half.write_all(b"getreqnft\nnope\n\ngetauthaddr\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "GET_NFT_REQ:ok");
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "ERROR: Invalid command 'nope'"
        );
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "GET_ADDR_AUTH:ok");

        drop(write_half);
        drop(lines);
        assert_eq!(serve.await.unwrap(), RelayExit::Closed);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let device = wallet();
        let relay = authed_relay(&device).await;
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = RemoteConnection::new(client, "test-server");
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let serve = tokio::spawn(async move { relay.serve(&mut conn, &token).await });
        shutdown.cancel();
        assert_eq!(serve.await.unwrap(), RelayExit::Cancelled);

        let mut lines = BufReader::new(server).lines();
        assert_eq!(lines.next_line().await.unwrap(), None);
    }
}
