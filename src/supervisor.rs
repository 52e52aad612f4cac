//! Built-in supervisor that restarts the bridge when it dies.
//!
//! `swbridge supervise` runs `swbridge serve` as a child and watches it. A
//! clean exit (code 0: the user declined the password, the control server
//! hung up, or a signal asked us to stop) ends supervision. Any other exit,
//! including a lost device (code 2) or a port that would not open (code 1),
//! restarts the child with exponential backoff. SIGINT/SIGTERM are forwarded
//! to the child.

use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;

/// Run the supervisor loop until the child exits cleanly.
pub async fn run_supervisor(
    config_path: Option<&str>,
    sup_config: &SupervisorConfig,
) -> std::io::Result<()> {
    let mut backoff = 1u64;
    let max_backoff = sup_config.max_backoff.max(1);
    let stable_threshold = Duration::from_secs(sup_config.stable_threshold);

    let exe = std::env::current_exe()?;

    loop {
        let started = Instant::now();

        let mut cmd = Command::new(&exe);
        cmd.arg("serve");
        if let Some(p) = config_path {
            cmd.args(["--config", p]);
        }

        let mut child = cmd.spawn()?;
        let child_pid = child.id();
        info!("Supervisor: started bridge (pid {child_pid:?})");

        // Forward SIGINT and SIGTERM to child
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let signal_task = tokio::spawn(async move {
            let sig = tokio::select! {
                _ = sigint.recv() => libc::SIGINT,
                _ = sigterm.recv() => libc::SIGTERM,
            };
            info!("Supervisor: forwarding signal {sig} to child");
            if let Some(pid) = child_pid {
                #[allow(clippy::cast_possible_wrap)]
                // SAFETY: plain kill(2) on the child's pid
                unsafe {
                    libc::kill(pid as i32, sig);
                }
            }
        });

        let status = child.wait().await;
        signal_task.abort();
        let uptime = started.elapsed();

        match status {
            Ok(s) if s.success() => {
                info!("Bridge exited cleanly, supervisor stopping");
                return Ok(());
            }
            Ok(s) => {
                warn!(
                    "Bridge exited: {s} (uptime {:.1}s), restarting in {backoff}s",
                    uptime.as_secs_f64()
                );
            }
            Err(e) => {
                error!(
                    "Bridge wait error: {e} (uptime {:.1}s), restarting in {backoff}s",
                    uptime.as_secs_f64()
                );
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = next_backoff(backoff, uptime, stable_threshold, max_backoff);
    }
}

/// Backoff for the next restart: reset after a stable run, else double.
fn next_backoff(current: u64, uptime: Duration, stable_threshold: Duration, max: u64) -> u64 {
    if uptime >= stable_threshold {
        1
    } else {
        current.saturating_mul(2).min(max)
    }
}
