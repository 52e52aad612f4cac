//! Where the startup password comes from.
//!
//! `SWBRIDGE_PASSWORD` wins when set, otherwise the user is asked on the
//! controlling terminal with echo turned off. An empty answer (or EOF) means
//! the user declined, and the bridge exits cleanly.

use std::io::{BufRead, Write};
use std::os::fd::AsFd;

use nix::sys::termios::{self, LocalFlags, SetArg};
use tracing::{debug, info};

pub const PASSWORD_ENV: &str = "SWBRIDGE_PASSWORD";

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("terminal I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("terminal setup: {0}")]
    Terminal(#[from] nix::Error),
}

/// Supplies the device password once at startup. Blocking.
pub trait PasswordSource: Send {
    /// `Ok(None)` when no password was provided.
    fn password(&mut self) -> Result<Option<String>, PromptError>;
}

/// Reads the password from an environment variable.
pub struct EnvPassword {
    var: String,
}

impl EnvPassword {
    #[must_use]
    pub fn new(var: &str) -> Self {
        Self {
            var: var.to_string(),
        }
    }
}

impl PasswordSource for EnvPassword {
    fn password(&mut self) -> Result<Option<String>, PromptError> {
        let value = std::env::var(&self.var).ok().filter(|v| !v.is_empty());
        if value.is_some() {
            info!(var = %self.var, "Prompt: using password from environment");
        }
        Ok(value)
    }
}

/// Interactive prompt on stdin/stderr with echo disabled.
pub struct TerminalPrompt {
    message: String,
}

impl TerminalPrompt {
    #[must_use]
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new("SecureWallet password: ")
    }
}

impl PasswordSource for TerminalPrompt {
    fn password(&mut self) -> Result<Option<String>, PromptError> {
        let stdin = std::io::stdin();
        let mut stderr = std::io::stderr();
        stderr.write_all(self.message.as_bytes())?;
        stderr.flush()?;

        // Not a tty (piped input): read as-is.
        let saved = termios::tcgetattr(stdin.as_fd()).ok();
        if let Some(saved) = &saved {
            let mut quiet = saved.clone();
            quiet.local_flags.remove(LocalFlags::ECHO);
            quiet.local_flags.insert(LocalFlags::ECHONL);
            termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &quiet)?;
        }

        let mut line = String::new();
        let read = stdin.lock().read_line(&mut line);

        if let Some(saved) = &saved {
            termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, saved)?;
        }
        read?;

        Ok(clean(&line))
    }
}

/// Env first, then the terminal.
pub struct DefaultPassword {
    env: EnvPassword,
    terminal: TerminalPrompt,
}

impl Default for DefaultPassword {
    fn default() -> Self {
        Self {
            env: EnvPassword::new(PASSWORD_ENV),
            terminal: TerminalPrompt::default(),
        }
    }
}

impl PasswordSource for DefaultPassword {
    fn password(&mut self) -> Result<Option<String>, PromptError> {
        if let Some(pw) = self.env.password()? {
            return Ok(Some(pw));
        }
        let pw = self.terminal.password()?;
        if pw.is_none() {
            debug!("Prompt: no password entered");
        }
        Ok(pw)
    }
}

/// Strip the line terminator; an empty result means no password.
fn clean(line: &str) -> Option<String> {
    let pw = line.trim_end_matches(['\r', '\n']);
    (!pw.is_empty()).then(|| pw.to_string())
}
