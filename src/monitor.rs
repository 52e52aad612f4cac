//! Background liveness monitor for the attached device.
//!
//! Every `interval` the monitor asks the transport whether the device is
//! still there. Checks are skipped while a relay command holds the
//! [`BusyFlag`]. After `max_failures` consecutive failed checks the monitor
//! tears the bridge down exactly once: the remote connection is cancelled,
//! the device transport is closed, and [`MonitorExit::DeviceLost`] is
//! returned to the caller, which decides how the process ends.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::{CommandProtocol, DeviceCommand, DeviceTransport};
use crate::relay::BusyFlag;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_FAILURES: u32 = 5;
/// Shortest accepted check interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Why the monitor task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// `failures` consecutive checks failed; the bridge was torn down.
    DeviceLost { failures: u32 },
    /// The stop token fired.
    Stopped,
}

/// Counters shared with the health endpoint.
#[derive(Debug, Default)]
pub struct MonitorStats {
    consecutive_failures: AtomicU32,
    checks_total: AtomicU64,
    skipped_busy: AtomicU64,
    device_lost: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub consecutive_failures: u32,
    pub checks_total: u64,
    pub skipped_busy: u64,
    pub device_lost: bool,
}

impl MonitorStats {
    #[must_use]
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            checks_total: self.checks_total.load(Ordering::Relaxed),
            skipped_busy: self.skipped_busy.load(Ordering::Relaxed),
            device_lost: self.device_lost.load(Ordering::Relaxed),
        }
    }

    /// Record one check outcome; returns the consecutive failure count.
    fn record(&self, healthy: bool) -> u32 {
        self.checks_total.fetch_add(1, Ordering::Relaxed);
        if healthy {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            0
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
        }
    }
}

pub struct LivenessMonitor {
    transport: DeviceTransport,
    protocol: CommandProtocol,
    busy: BusyFlag,
    remote_shutdown: CancellationToken,
    interval: Duration,
    max_failures: u32,
    status_refresh: bool,
    stats: Arc<MonitorStats>,
}

impl LivenessMonitor {
    /// `remote_shutdown` is cancelled when the device is declared lost.
    #[must_use]
    pub fn new(
        protocol: CommandProtocol,
        busy: BusyFlag,
        remote_shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport: protocol.transport().clone(),
            protocol,
            busy,
            remote_shutdown,
            interval: DEFAULT_INTERVAL,
            max_failures: DEFAULT_MAX_FAILURES,
            status_refresh: false,
            stats: Arc::new(MonitorStats::default()),
        }
    }

    /// Time between checks. Clamped to at least [`MIN_INTERVAL`].
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Consecutive failed checks before teardown. Zero is treated as one.
    #[must_use]
    pub fn max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    /// Also send `GET_STATUS` after every successful presence check.
    #[must_use]
    pub fn status_refresh(mut self, enabled: bool) -> Self {
        self.status_refresh = enabled;
        self
    }

    #[must_use]
    pub fn stats(&self) -> Arc<MonitorStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the monitor. It runs until the device is lost or `stop` fires.
    pub fn spawn(self, stop: CancellationToken) -> tokio::task::JoinHandle<MonitorExit> {
        tokio::spawn(async move { self.run(stop).await })
    }

    pub async fn run(self, stop: CancellationToken) -> MonitorExit {
        info!(
            port = %self.transport.port(),
            interval_ms = self.interval.as_millis() as u64,
            max_failures = self.max_failures,
            "Monitor: started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the first check waits one interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = stop.cancelled() => {
                    info!("Monitor: stopped");
                    return MonitorExit::Stopped;
                }
                _ = ticker.tick() => {}
            }

            if self.busy.is_busy() {
                self.stats.skipped_busy.fetch_add(1, Ordering::Relaxed);
                debug!("Monitor: command in flight, skipping check");
                continue;
            }

            let healthy = self.check().await;
            let failures = self.stats.record(healthy);
            if healthy {
                continue;
            }

            warn!(
                failures,
                max = self.max_failures,
                "Monitor: device check failed"
            );
            if failures >= self.max_failures {
                self.teardown(failures).await;
                return MonitorExit::DeviceLost { failures };
            }
        }
    }

    /// One liveness check. Only a transport failure counts against the
    /// device; a slow `GET_STATUS` reply does not.
    async fn check(&self) -> bool {
        if !self.transport.probe().await {
            return false;
        }
        if !self.status_refresh {
            return true;
        }
        match self.protocol.execute(&DeviceCommand::GetStatus).await {
            Ok(status) => {
                debug!(status = %status, "Monitor: device status");
                true
            }
            Err(e) if e.is_fatal() => {
                warn!("Monitor: status request failed: {e}");
                false
            }
            Err(e) => {
                debug!("Monitor: status request: {e}");
                true
            }
        }
    }

    async fn teardown(&self, failures: u32) {
        if self.stats.device_lost.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(
            port = %self.transport.port(),
            failures,
            "Monitor: device lost, shutting down bridge"
        );
        self.remote_shutdown.cancel();
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;

    fn monitor_for(device: &MockDevice) -> (LivenessMonitor, BusyFlag, CancellationToken) {
        let transport = DeviceTransport::new(device.link(), "mock", Duration::from_millis(10));
        let protocol = CommandProtocol::new(transport, Duration::from_millis(50));
        let busy = BusyFlag::new();
        let remote = CancellationToken::new();
        let monitor = LivenessMonitor::new(protocol, busy.clone(), remote.clone())
            .interval(Duration::from_millis(10));
        (monitor, busy, remote)
    }

    #[test]
    fn test_record_resets_on_success() {
        let stats = MonitorStats::default();
        assert_eq!(stats.record(false), 1);
        assert_eq!(stats.record(false), 2);
        assert_eq!(stats.record(false), 3);
        assert_eq!(stats.record(true), 0);
        assert_eq!(stats.record(false), 1);
        assert_eq!(stats.snapshot().checks_total, 5);
    }

    #[test]
    fn test_zero_max_failures_clamped() {
        let device = MockDevice::silent();
        let (monitor, _, _) = monitor_for(&device);
        assert_eq!(monitor.max_failures(0).max_failures, 1);
    }

    #[tokio::test]
    async fn test_zero_interval_clamped() {
        let device = MockDevice::silent();
        let (monitor, _, _) = monitor_for(&device);
        let monitor = monitor.interval(Duration::ZERO);
        assert_eq!(monitor.interval, MIN_INTERVAL);

        let stop = CancellationToken::new();
        let handle = monitor.spawn(stop.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();
        assert_eq!(handle.await.unwrap(), MonitorExit::Stopped);
        assert!(device.probes() > 0);
    }

    #[tokio::test]
    async fn test_no_probes_while_busy() {
        let device = MockDevice::silent();
        let (monitor, busy, _remote) = monitor_for(&device);
        let stats = monitor.stats();
        let stop = CancellationToken::new();

        let _guard = busy.raise();
        let handle = monitor.spawn(stop.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        stop.cancel();

        assert_eq!(handle.await.unwrap(), MonitorExit::Stopped);
        assert_eq!(device.probes(), 0);
        assert!(stats.snapshot().skipped_busy > 0);
    }

    #[tokio::test]
    async fn test_healthy_device_keeps_running() {
        let device = MockDevice::silent();
        let (monitor, _busy, remote) = monitor_for(&device);
        let stats = monitor.stats();
        let stop = CancellationToken::new();

        let handle = monitor.spawn(stop.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        stop.cancel();

        assert_eq!(handle.await.unwrap(), MonitorExit::Stopped);
        assert!(device.probes() > 0);
        assert_eq!(device.closes(), 0);
        assert!(!remote.is_cancelled());
        assert_eq!(stats.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_device_lost_tears_down_once() {
        let device = MockDevice::silent();
        device.set_present(false);
        let (monitor, _busy, remote) = monitor_for(&device);
        let transport = monitor.transport.clone();
        let stats = monitor.stats();

        let exit = monitor.max_failures(5).run(CancellationToken::new()).await;

        assert_eq!(exit, MonitorExit::DeviceLost { failures: 5 });
        assert_eq!(device.probes(), 5);
        assert_eq!(device.closes(), 1);
        assert!(remote.is_cancelled());
        assert!(stats.snapshot().device_lost);

        // A later shutdown path closing the device again is a no-op.
        assert!(!transport.close().await);
        assert_eq!(device.closes(), 1);
    }

    #[tokio::test]
    async fn test_status_refresh_sends_get_status() {
        let device = MockDevice::new(|line| (line == "GET_STATUS").then(|| "READY".to_string()));
        let (monitor, _busy, _remote) = monitor_for(&device);
        let stop = CancellationToken::new();

        let handle = monitor.status_refresh(true).spawn(stop.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        handle.await.unwrap();

        assert!(device.written().starts_with("GET_STATUS\n"));
    }

    #[tokio::test]
    async fn test_status_timeout_is_not_a_failure() {
        let device = MockDevice::silent();
        let (monitor, _busy, remote) = monitor_for(&device);
        let stats = monitor.stats();
        let stop = CancellationToken::new();

        let handle = monitor
            .max_failures(1)
            .status_refresh(true)
            .spawn(stop.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        stop.cancel();

        assert_eq!(handle.await.unwrap(), MonitorExit::Stopped);
        assert!(!remote.is_cancelled());
        assert_eq!(stats.snapshot().consecutive_failures, 0);
    }
}
