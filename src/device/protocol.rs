//! Request/response exchange with the device.
//!
//! The device protocol is half-duplex with at most one outstanding request:
//! write one line, read one line. [`CommandProtocol::execute`] holds the
//! transport lock for the whole exchange and returns the first non-empty
//! line that arrives before the deadline.
//!
//! Correlation is first-line-wins. The lock rules out replies belonging to
//! another caller's request, but a line the device emits on its own between
//! two requests (a status push, a boot banner) is still taken as the reply
//! to the next request. The device echoes no request tag, so this cannot be
//! tightened from the host side.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{DeviceCommand, DeviceError, DeviceTransport, SerialLink};

/// Default deadline for one command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends [`DeviceCommand`]s over a shared [`DeviceTransport`].
#[derive(Clone)]
pub struct CommandProtocol {
    transport: DeviceTransport,
    timeout: Duration,
}

impl CommandProtocol {
    #[must_use]
    pub fn new(transport: DeviceTransport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// The transport this protocol writes to.
    #[must_use]
    pub fn transport(&self) -> &DeviceTransport {
        &self.transport
    }

    /// Default per-command deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute a command with the default deadline.
    pub async fn execute(&self, command: &DeviceCommand) -> Result<String, DeviceError> {
        self.execute_with_timeout(command, self.timeout).await
    }

    /// Execute a command, waiting at most `timeout` for its reply.
    pub async fn execute_with_timeout(
        &self,
        command: &DeviceCommand,
        timeout: Duration,
    ) -> Result<String, DeviceError> {
        let line = command.wire_line()?;
        let read_timeout = self.transport.read_timeout();
        let started = Instant::now();

        let result = self
            .transport
            .exchange(move |link| {
                link.send_line(&line)?;
                await_reply(link, timeout, read_timeout)
            })
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(reply) => match command {
                DeviceCommand::Pass(_) => debug!(command = %command, elapsed_ms, "Device: reply received"),
                _ => info!(command = %command, reply = %reply, elapsed_ms, "Device: reply received"),
            },
            Err(e) => warn!(command = %command, elapsed_ms, "Device: command failed: {e}"),
        }
        result
    }
}

/// Read until a non-empty line arrives or `timeout` elapses.
///
/// Each read blocks for at most `read_timeout` (or whatever remains of the
/// deadline, if less), so this returns no later than one read granularity
/// past the deadline.
pub(crate) fn await_reply(
    link: &mut dyn SerialLink,
    timeout: Duration,
    read_timeout: Duration,
) -> Result<String, DeviceError> {
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(DeviceError::Timeout(timeout));
        }
        let wait = (deadline - now).min(read_timeout);
        if let Some(line) = link.receive_line(wait)? {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
    }
}
