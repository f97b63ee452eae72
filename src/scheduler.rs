//! Periodic producers for the outbound queue and the link health check.
//!
//! None of these tasks touch zone state. Refresh and heartbeat only enqueue
//! requests; the health check only signals the listener, which performs the
//! reconnect itself while it owns the transport.

use crate::outbound::OutboundSender;
use crate::protocol::{DeviceAddress, PendingCommand};
use crate::zones::ZONE_COUNT;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_JITTER_PERCENT: u8 = 25;

/// Spreads `base` uniformly over `base ± percent%`.
pub fn apply_jitter(base: Duration, percent: u8) -> Duration {
    let percent = percent.min(100);
    if percent == 0 || base.is_zero() {
        return base;
    }
    let factor = f64::from(percent) / 100.0;
    let scale = rand::thread_rng().gen_range((1.0 - factor)..=(1.0 + factor));
    base.mul_f64(scale)
}

/// One name and one info request for every real zone.
pub fn refresh_burst(controller: DeviceAddress) -> Vec<PendingCommand> {
    let mut burst = Vec::with_capacity(2 * usize::from(ZONE_COUNT));
    for zone_id in 0..ZONE_COUNT {
        burst.push(PendingCommand::zone_name_request(controller, zone_id));
        burst.push(PendingCommand::zone_info_request(controller, zone_id));
    }
    burst
}

/// Requests sent once after the link comes up.
pub fn startup_requests(controller: DeviceAddress) -> Vec<PendingCommand> {
    vec![
        PendingCommand::heartbeat_request(controller),
        PendingCommand::controller_mode_request(controller),
        PendingCommand::device_info_request(controller, 0),
    ]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub refresh_bursts: u32,
    pub heartbeats: u32,
    pub reconnect_signals: u32,
}

/// Tracks when the bus last delivered a line.
#[derive(Debug)]
pub struct LinkMonitor {
    origin: Instant,
    last_activity_ms: AtomicU64,
}

impl LinkMonitor {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn record_activity(&self) {
        let elapsed = self.origin.elapsed().as_millis();
        self.last_activity_ms
            .store(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }

    pub fn is_stale(&self, link_timeout: Duration) -> bool {
        self.idle_for() > link_timeout
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared by the periodic tasks; counters are cumulative for the process.
#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    controller: DeviceAddress,
    queue: OutboundSender,
    jitter_percent: u8,
    stats: Arc<SchedulerCounters>,
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    refresh_bursts: AtomicU64,
    heartbeats: AtomicU64,
    reconnect_signals: AtomicU64,
}

impl RefreshScheduler {
    pub fn new(controller: DeviceAddress, queue: OutboundSender, jitter_percent: u8) -> Self {
        Self {
            controller,
            queue,
            jitter_percent,
            stats: Arc::default(),
        }
    }

    pub fn get_stats(&self) -> SchedulerStats {
        let load = |counter: &AtomicU64| u32::try_from(counter.load(Ordering::Relaxed)).unwrap_or(u32::MAX);
        SchedulerStats {
            refresh_bursts: load(&self.stats.refresh_bursts),
            heartbeats: load(&self.stats.heartbeats),
            reconnect_signals: load(&self.stats.reconnect_signals),
        }
    }

    /// Queues the startup requests. Returns `false` if the queue has closed.
    pub async fn enqueue_startup_requests(&self) -> bool {
        for command in startup_requests(self.controller) {
            if self.queue.enqueue(command).await.is_err() {
                return false;
            }
        }
        debug!("Startup requests queued");
        true
    }

    /// Queues a full refresh burst and bumps `generation` so the listener can
    /// restore every zone's repair allowance.
    pub async fn enqueue_refresh(&self, generation: &watch::Sender<u64>) -> bool {
        for command in refresh_burst(self.controller) {
            if self.queue.enqueue(command).await.is_err() {
                return false;
            }
        }
        generation.send_modify(|g| *g = g.wrapping_add(1));
        self.stats.refresh_bursts.fetch_add(1, Ordering::Relaxed);
        info!("Queued zone refresh for {} zones", ZONE_COUNT);
        true
    }

    /// Refreshes immediately, then every `interval` (jittered) until cancelled.
    pub async fn run_refresh(
        self,
        interval: Duration,
        generation: watch::Sender<u64>,
        cancel: CancellationToken,
    ) {
        loop {
            if !self.enqueue_refresh(&generation).await {
                warn!("Outbound queue closed, stopping zone refresh");
                return;
            }
            let wait = apply_jitter(interval, self.jitter_percent);
            debug!("Next zone refresh in {:?}", wait);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Sends a liveness request every `interval` (jittered) until cancelled.
    pub async fn run_heartbeat(self, interval: Duration, cancel: CancellationToken) {
        loop {
            let wait = apply_jitter(interval, self.jitter_percent);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if self
                .queue
                .enqueue(PendingCommand::heartbeat_request(self.controller))
                .await
                .is_err()
            {
                warn!("Outbound queue closed, stopping heartbeat");
                return;
            }
            self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Signals `reconnect` whenever the link has been silent for longer than
    /// `link_timeout`.
    pub async fn run_health_check(
        self,
        monitor: Arc<LinkMonitor>,
        interval: Duration,
        link_timeout: Duration,
        reconnect: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        loop {
            let wait = apply_jitter(interval, self.jitter_percent);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if monitor.is_stale(link_timeout) {
                warn!(
                    idle_secs = monitor.idle_for().as_secs(),
                    "No traffic from the bridge, requesting reconnect"
                );
                // Restart the idle window so one outage triggers one reset.
                monitor.record_activity();
                reconnect.notify_one();
                self.stats.reconnect_signals.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
