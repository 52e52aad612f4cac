//! Device command set and wire encoding.
//!
//! Every request the bridge can put on the serial line is a variant of
//! [`DeviceCommand`]. Whether a command carries an argument is fixed by its
//! variant, so a `SET_NFT_REQ` without an NFT id cannot be built.

use std::fmt;

use super::DeviceError;

/// Reply the device sends after a correct `PASS`.
pub const PASSWORD_OK: &str = "PASSWORD_OK";
/// Reply the device sends after a wrong `PASS`.
pub const PASSWORD_FAIL: &str = "FAIL";
/// Reply the device sends after `LOGOUT`.
pub const LOGGED_OUT: &str = "Logged out";

/// A single request to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// `PASS <password>`: unlock the device.
    Pass(String),
    /// `LOGOUT`: lock the device again.
    Logout,
    GetNftReq,
    GetNftAuth,
    SetNftReq(String),
    SetNftAuth(String),
    RemoveNftReq,
    RemoveNftAuth,
    SignMsgReq(String),
    SignMsgAuth(String),
    GetAddrReq,
    GetAddrAuth,
    /// `GET_STATUS`: status refresh issued by the liveness monitor.
    GetStatus,
}

impl DeviceCommand {
    /// Wire keyword, the first token of the request line.
    #[must_use]
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Pass(_) => "PASS",
            Self::Logout => "LOGOUT",
            Self::GetNftReq => "GET_NFT_REQ",
            Self::GetNftAuth => "GET_NFT_AUTH",
            Self::SetNftReq(_) => "SET_NFT_REQ",
            Self::SetNftAuth(_) => "SET_NFT_AUTH",
            Self::RemoveNftReq => "REMOVE_NFT_REQ",
            Self::RemoveNftAuth => "REMOVE_NFT_AUTH",
            Self::SignMsgReq(_) => "SIGN_MSG_REQ",
            Self::SignMsgAuth(_) => "SIGN_MSG_AUTH",
            Self::GetAddrReq => "GET_ADDR_REQ",
            Self::GetAddrAuth => "GET_ADDR_AUTH",
            Self::GetStatus => "GET_STATUS",
        }
    }

    /// The single argument, if this command takes one.
    #[must_use]
    pub fn argument(&self) -> Option<&str> {
        match self {
            Self::Pass(arg)
            | Self::SetNftReq(arg)
            | Self::SetNftAuth(arg)
            | Self::SignMsgReq(arg)
            | Self::SignMsgAuth(arg) => Some(arg),
            Self::Logout
            | Self::GetNftReq
            | Self::GetNftAuth
            | Self::RemoveNftReq
            | Self::RemoveNftAuth
            | Self::GetAddrReq
            | Self::GetAddrAuth
            | Self::GetStatus => None,
        }
    }

    /// Build the request line (without the trailing newline).
    ///
    /// Arguments may not contain line breaks: the device would read the
    /// remainder as a second command.
    pub fn wire_line(&self) -> Result<String, DeviceError> {
        match self.argument() {
            None => Ok(self.keyword().to_string()),
            Some(arg) if arg.contains(['\r', '\n']) => Err(DeviceError::InvalidArgument(format!(
                "{} argument contains a line break",
                self.keyword()
            ))),
            Some(arg) => Ok(format!("{} {arg}", self.keyword())),
        }
    }
}

/// Log-safe rendering: the `PASS` argument is masked.
impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass(_) => write!(f, "PASS ****"),
            other => match other.argument() {
                Some(arg) => write!(f, "{} {arg}", other.keyword()),
                None => f.write_str(other.keyword()),
            },
        }
    }
}
