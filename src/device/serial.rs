//! Native serial link to the SecureWallet over termios.
//!
//! The port is opened raw 8N1 with no flow control and `VMIN=0, VTIME=1`,
//! so a `read()` returns after 100ms of silence. [`SerialPort::receive_line`]
//! loops those short reads against its own deadline and keeps any bytes past
//! the first newline for the next call.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tracing::{debug, info};

use super::{DeviceError, SerialLink};

/// The device firmware only speaks 115200 baud.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Bytes requested per `read()`.
const READ_BUF_SIZE: usize = 256;

/// Refuse to buffer more than this without seeing a newline.
const MAX_LINE_LEN: usize = 8 * 1024;

/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// An open serial device.
pub struct SerialPort {
    fd: RawFd,
    path: String,
    pending: Vec<u8>,
    closed: bool,
}

impl SerialPort {
    /// Open `path` (e.g. `/dev/ttyUSB0`) at `baud` and discard stale input.
    pub fn open(path: &str, baud: u32) -> Result<Self, DeviceError> {
        let speed = baud_rate(baud)?;
        let fd = fcntl::open(
            path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| DeviceError::Transport(format!("open {path}: {e}")))?;

        let port = Self {
            fd,
            path: path.to_string(),
            pending: Vec::with_capacity(READ_BUF_SIZE),
            closed: false,
        };

        // Back to blocking reads; VTIME bounds each read instead.
        let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL)
            .map_err(|e| DeviceError::Transport(format!("F_GETFL: {e}")))?;
        let mut oflags = OFlag::from_bits_truncate(flags);
        oflags.remove(OFlag::O_NONBLOCK);
        fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags))
            .map_err(|e| DeviceError::Transport(format!("F_SETFL: {e}")))?;

        configure_termios(fd, speed)?;

        // SAFETY: fd is valid, we just opened it and `port` owns it
        unsafe {
            termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH)
                .map_err(|e| DeviceError::Transport(format!("tcflush: {e}")))?;
        }

        info!(port = %path, baud, "Device: serial port opened (8N1)");
        Ok(port)
    }

    /// Pop one complete line from the pending buffer, if there is one.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(sanitize_line(&String::from_utf8_lossy(&raw)))
    }
}

impl SerialLink for SerialPort {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        // SAFETY: fd stays open until `close()`, checked above
        let bfd = unsafe { borrow_fd(self.fd) };
        write_fully(bytes, |chunk| unistd::write(bfd, chunk))
            .map_err(|e| DeviceError::Transport(format!("write {}: {e}", self.path)))?;
        termios::tcdrain(bfd)
            .map_err(|e| DeviceError::Transport(format!("tcdrain {}: {e}", self.path)))?;
        Ok(())
    }

    fn receive_line(&mut self, timeout: Duration) -> Result<Option<String>, DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match unistd::read(self.fd, &mut buf) {
                // VTIME expired with no data
                Ok(0) | Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {}
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if self.pending.len() > MAX_LINE_LEN && !self.pending.contains(&b'\n') {
                        debug!(port = %self.path, "Device: discarding {} bytes without newline", self.pending.len());
                        self.pending.clear();
                    }
                }
                Err(e) => return Err(DeviceError::Transport(format!("read {}: {e}", self.path))),
            }
        }
    }

    fn is_present(&mut self) -> bool {
        if self.closed || !Path::new(&self.path).exists() {
            return false;
        }
        // SAFETY: fd stays open until `close()`, checked above
        let bfd = unsafe { borrow_fd(self.fd) };
        termios::tcgetattr(bfd).is_ok()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = unistd::close(self.fd);
        debug!(port = %self.path, "Device: fd closed");
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        self.close();
    }
}

fn baud_rate(baud: u32) -> Result<BaudRate, DeviceError> {
    match baud {
        9_600 => Ok(BaudRate::B9600),
        19_200 => Ok(BaudRate::B19200),
        38_400 => Ok(BaudRate::B38400),
        57_600 => Ok(BaudRate::B57600),
        115_200 => Ok(BaudRate::B115200),
        230_400 => Ok(BaudRate::B230400),
        other => Err(DeviceError::InvalidArgument(format!(
            "unsupported baud rate {other}"
        ))),
    }
}

/// Raw mode, 8N1, no flow control, `VMIN=0 VTIME=1`.
fn configure_termios(fd: RawFd, speed: BaudRate) -> Result<(), DeviceError> {
    // SAFETY: fd is valid, caller just opened it
    let borrowed = unsafe { borrow_fd(fd) };
    let err = |what: &str, e: nix::Error| DeviceError::Transport(format!("{what}: {e}"));

    let mut tio = termios::tcgetattr(borrowed).map_err(|e| err("tcgetattr", e))?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetispeed(&mut tio, speed).map_err(|e| err("cfsetispeed", e))?;
    termios::cfsetospeed(&mut tio, speed).map_err(|e| err("cfsetospeed", e))?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio).map_err(|e| err("tcsetattr", e))
}

/// Trim and drop control characters and U+FFFD left by a lossy decode.
///
/// Boot noise on the ESP32 UART often carries NULs and half bytes that would
/// otherwise break exact-match replies like `PASSWORD_OK`.
/// Hand `bytes` to `write` until every byte is accepted.
fn write_fully(
    bytes: &[u8],
    mut write: impl FnMut(&[u8]) -> nix::Result<usize>,
) -> Result<(), String> {
    let mut written = 0;
    while written < bytes.len() {
        match write(&bytes[written..]) {
            Ok(0) => return Err("write returned 0".to_string()),
            Ok(n) => written += n,
            Err(nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}

fn sanitize_line(line: &str) -> String {
    line.chars()
        .filter(|&c| !c.is_control() && c != '\u{FFFD}')
        .collect::<String>()
        .trim()
        .to_string()
}
