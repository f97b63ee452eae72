//! Outbound request queue and its single consumer.

use crate::protocol::{PendingCommand, TelegramEncoder};
use crate::transport::Transport;
use crate::zones::ZONE_COUNT;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_REPAIR_LIMIT: u8 = 3;

// A full refresh burst (name + info per zone) must fit without blocking decode.
const_assert!(OUTBOUND_QUEUE_CAPACITY >= 2 * ZONE_COUNT as usize);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboundError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("outbound queue closed")]
    QueueClosed,
}

/// Producer handle; cheap to clone into periodic tasks.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<PendingCommand>,
}

impl OutboundSender {
    /// Waits for room in the queue. Used by periodic producers.
    pub async fn enqueue(&self, command: PendingCommand) -> Result<(), OutboundError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| OutboundError::QueueClosed)
    }

    /// Never waits. Used from the decode path.
    pub fn try_enqueue(&self, command: PendingCommand) -> Result<(), OutboundError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OutboundError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => OutboundError::QueueClosed,
        })
    }

    /// Free slots left in the queue.
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer handle, owned by the listener's main loop.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<PendingCommand>,
}

impl OutboundReceiver {
    /// Next queued command, if any, without waiting.
    pub fn try_next(&mut self) -> Option<PendingCommand> {
        self.rx.try_recv().ok()
    }
}

pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutboundSender { tx }, OutboundReceiver { rx })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub sent: u32,
    pub failed: u32,
    pub unencodable: u32,
}

/// Renders queued commands and writes them to the transport, one at a time.
#[derive(Debug)]
pub struct Dispatcher {
    encoder: TelegramEncoder,
    settle_delay: Duration,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(encoder: TelegramEncoder, settle_delay: Duration) -> Self {
        Self {
            encoder,
            settle_delay,
            stats: DispatchStats::default(),
        }
    }

    /// Sends one command. Failures are logged and the command dropped.
    ///
    /// After a write attempt the bridge needs quiet time, so this waits
    /// `settle_delay` before returning unless `cancel` fires first.
    pub async fn dispatch<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        command: &PendingCommand,
        cancel: &CancellationToken,
    ) -> bool {
        let line = match self.encoder.encode(command) {
            Ok(line) => line,
            Err(e) => {
                warn!(command = %command.command, "Cannot encode command, dropping it: {}", e);
                self.stats.unencodable = self.stats.unencodable.saturating_add(1);
                return false;
            }
        };

        info!(msg = %line, "> {}", command.command);

        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");

        let sent = match transport.write(&bytes).await {
            Ok(()) => {
                self.stats.sent = self.stats.sent.saturating_add(1);
                true
            }
            Err(e) => {
                error!("Sending {} command failed: {}", command.command, e);
                self.stats.failed = self.stats.failed.saturating_add(1);
                false
            }
        };

        if !self.settle_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.settle_delay) => {}
            }
        }
        sent
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }
}

/// Caps how many zone-name repairs may be outstanding for each zone.
///
/// A zone's allowance is restored when its name decodes or when a periodic
/// refresh has re-requested every zone anyway.
#[derive(Debug, Clone)]
pub struct RepairBudget {
    limit: u8,
    outstanding: HashMap<u8, u8>,
}

impl RepairBudget {
    pub fn new(limit: u8) -> Self {
        Self {
            limit,
            outstanding: HashMap::new(),
        }
    }

    /// Claims one repair for the zone; `false` when the zone is out of repairs.
    pub fn try_acquire(&mut self, zone_id: u8) -> bool {
        let used = self.outstanding.entry(zone_id).or_insert(0);
        if *used >= self.limit {
            return false;
        }
        *used += 1;
        true
    }

    /// Restores the zone's full allowance after its name decoded.
    pub fn release(&mut self, zone_id: u8) {
        self.outstanding.remove(&zone_id);
    }

    /// Returns one claimed repair that was never sent.
    pub fn give_back(&mut self, zone_id: u8) {
        if let Some(used) = self.outstanding.get_mut(&zone_id) {
            *used = used.saturating_sub(1);
        }
    }

    pub fn reset(&mut self) {
        self.outstanding.clear();
    }

    pub fn outstanding(&self, zone_id: u8) -> u8 {
        self.outstanding.get(&zone_id).copied().unwrap_or(0)
    }
}

impl Default for RepairBudget {
    fn default() -> Self {
        Self::new(DEFAULT_REPAIR_LIMIT)
    }
}
