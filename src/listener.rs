//! The listener's main loop.
//!
//! [`BusListener`] exclusively owns the transport and the [`ZoneStore`]. Each
//! iteration sends at most one queued command, then waits up to the read timeout
//! for the next line and runs it through parse, decode and the measurement sink.
//! Periodic tasks reach it only through the handles in [`ListenerHandles`].

use crate::catalog::CommandCatalog;
use crate::config::ListenerConfig;
use crate::decoders::{decode, FollowUp};
use crate::measurement::{MeasurementSink, SinkError};
use crate::outbound::{
    outbound_queue, Dispatcher, OutboundError, OutboundReceiver, OutboundSender, RepairBudget,
    DEFAULT_REPAIR_LIMIT, DEFAULT_SETTLE_DELAY, OUTBOUND_QUEUE_CAPACITY,
};
use crate::protocol::{DeviceAddress, ProtocolError, TelegramEncoder, TelegramParser};
use crate::scheduler::LinkMonitor;
use crate::transport::{LineRead, Transport, TransportError};
use crate::zones::{ZoneSnapshot, ZoneStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("protocol setup failed: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("measurement sink failed: {0}")]
    Sink(#[from] SinkError),
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
}

/// Timing and limits for the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSettings {
    pub read_timeout: Duration,
    pub settle_delay: Duration,
    pub reconnect_delay: Duration,
    pub repair_limit: u8,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(2000),
            settle_delay: DEFAULT_SETTLE_DELAY,
            reconnect_delay: Duration::from_secs(5),
            repair_limit: DEFAULT_REPAIR_LIMIT,
        }
    }
}

impl From<&ListenerConfig> for ListenerSettings {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            settle_delay: config.settle_delay(),
            reconnect_delay: config.reconnect_delay(),
            repair_limit: config.repair_limit,
        }
    }
}

/// Counters for what the loop has seen so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerState {
    pub running: bool,
    pub lines_read: u64,
    pub lines_dropped: u64,
    pub telegrams_decoded: u64,
    pub fallback_telegrams: u64,
    pub measurements_emitted: u64,
    pub repairs_queued: u32,
    pub repairs_dropped: u32,
    pub follow_ups_dropped: u32,
    pub reconnects: u32,
    pub last_error: Option<String>,
}

/// Everything the periodic tasks need to talk to a [`BusListener`].
#[derive(Debug)]
pub struct ListenerHandles {
    pub outbound: OutboundSender,
    /// Bumped by the refresh task after each burst.
    pub refresh_generation: watch::Sender<u64>,
    pub snapshots: watch::Receiver<ZoneSnapshot>,
    pub monitor: Arc<LinkMonitor>,
    pub reconnect: Arc<Notify>,
}

enum Wake {
    Cancelled,
    Reconnect,
    Read(Result<Option<LineRead>, TransportError>),
}

pub struct BusListener<T, S> {
    transport: T,
    sink: S,
    parser: TelegramParser,
    dispatcher: Dispatcher,
    store: ZoneStore,
    outbound_rx: OutboundReceiver,
    outbound_tx: OutboundSender,
    repairs: RepairBudget,
    refresh_generation: watch::Receiver<u64>,
    snapshots: watch::Sender<ZoneSnapshot>,
    monitor: Arc<LinkMonitor>,
    reconnect: Arc<Notify>,
    settings: ListenerSettings,
    state: ListenerState,
}

impl<T: Transport, S: MeasurementSink> BusListener<T, S> {
    pub fn new(
        transport: T,
        sink: S,
        catalog: Arc<CommandCatalog>,
        gateway: DeviceAddress,
        store: ZoneStore,
        settings: ListenerSettings,
    ) -> Result<(Self, ListenerHandles), ListenerError> {
        let parser = TelegramParser::new(Arc::clone(&catalog))?;
        let dispatcher = Dispatcher::new(TelegramEncoder::new(catalog, gateway), settings.settle_delay);
        let (outbound_tx, outbound_rx) = outbound_queue(OUTBOUND_QUEUE_CAPACITY);
        let (generation_tx, generation_rx) = watch::channel(0u64);
        let (snapshot_tx, snapshot_rx) = watch::channel(store.snapshot());
        let monitor = Arc::new(LinkMonitor::new());
        let reconnect = Arc::new(Notify::new());

        let handles = ListenerHandles {
            outbound: outbound_tx.clone(),
            refresh_generation: generation_tx,
            snapshots: snapshot_rx,
            monitor: Arc::clone(&monitor),
            reconnect: Arc::clone(&reconnect),
        };

        let listener = Self {
            transport,
            sink,
            parser,
            dispatcher,
            store,
            outbound_rx,
            outbound_tx,
            repairs: RepairBudget::new(settings.repair_limit),
            refresh_generation: generation_rx,
            snapshots: snapshot_tx,
            monitor,
            reconnect,
            settings,
            state: ListenerState::default(),
        };
        Ok((listener, handles))
    }

    pub fn get_state(&self) -> &ListenerState {
        &self.state
    }

    pub fn store(&self) -> &ZoneStore {
        &self.store
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Zone-name repairs currently counted against `zone_id`.
    pub fn outstanding_repairs(&self, zone_id: u8) -> u8 {
        self.repairs.outstanding(zone_id)
    }

    /// Runs until `cancel` fires or the measurement sink fails for good.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ListenerError> {
        self.state.running = true;
        self.monitor.record_activity();
        info!("Listening on {}", self.transport.describe());

        let result = self.run_loop(&cancel).await;

        self.state.running = false;
        self.snapshots.send_replace(self.store.snapshot());
        let flushed = self.flush_sink();
        if let Err(e) = self.transport.close().await {
            warn!("Closing transport failed: {}", e);
        }
        // a loop failure takes precedence over a failed final flush
        let result = result.and(flushed);
        if let Err(e) = &result {
            error!("Listener stopped: {}", e);
            self.state.last_error = Some(e.to_string());
        } else {
            info!("Listener stopped");
        }
        result
    }

    /// Final delivery attempt for rows the sink is still holding.
    fn flush_sink(&mut self) -> Result<(), ListenerError> {
        match self.sink.flush() {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(pending = self.sink.pending(), "Measurements left undelivered at shutdown: {}", e);
                Err(e.into())
            }
        }
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<(), ListenerError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.apply_refresh_generation();

            if let Some(command) = self.outbound_rx.try_next() {
                self.dispatcher.dispatch(&mut self.transport, &command, cancel).await;
            }

            let read_timeout = self.settings.read_timeout;
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = self.reconnect.notified() => Wake::Reconnect,
                read = self.transport.read_line(read_timeout) => Wake::Read(read),
            };

            match wake {
                Wake::Cancelled => return Ok(()),
                Wake::Reconnect => self.reset_link(cancel).await,
                Wake::Read(Ok(Some(line))) => self.process_line(&line)?,
                Wake::Read(Ok(None)) => {}
                Wake::Read(Err(e)) => {
                    warn!("Transport fault: {}", e);
                    self.state.last_error = Some(e.to_string());
                    self.reset_link(cancel).await;
                }
            }
        }
    }

    /// Reconnects the transport, retrying after `reconnect_delay` until it
    /// succeeds or shutdown is requested.
    async fn reset_link(&mut self, cancel: &CancellationToken) {
        loop {
            self.state.reconnects = self.state.reconnects.saturating_add(1);
            match self.transport.reconnect().await {
                Ok(()) => {
                    info!("Reconnected to {}", self.transport.describe());
                    self.monitor.record_activity();
                    return;
                }
                Err(e) => {
                    warn!("Reconnect failed, retrying in {:?}: {}", self.settings.reconnect_delay, e);
                    self.state.last_error = Some(e.to_string());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
    }

    fn apply_refresh_generation(&mut self) {
        if self.refresh_generation.has_changed().unwrap_or(false) {
            self.refresh_generation.borrow_and_update();
            self.repairs.reset();
        }
    }

    /// Handles one inbound line end to end. Only a fatal sink failure is returned;
    /// everything else is logged and absorbed.
    pub fn process_line(&mut self, line: &LineRead) -> Result<(), ListenerError> {
        self.monitor.record_activity();
        self.state.lines_read += 1;

        if line.is_truncated() {
            debug!(msg = %line.text(), "Dropping truncated line");
            self.state.lines_dropped += 1;
            return Ok(());
        }

        let telegram = match self.parser.parse(line.text()) {
            Ok(telegram) => telegram,
            Err(e) => {
                debug!(msg = %line.text(), "Dropping line: {}", e);
                self.state.lines_dropped += 1;
                return Ok(());
            }
        };

        let outcome = decode(&telegram, &mut self.store);
        self.state.telegrams_decoded += 1;
        if outcome.fallback {
            self.state.fallback_telegrams += 1;
        }
        if let Some(zone_id) = outcome.named_zone {
            self.repairs.release(zone_id);
        }

        for follow_up in outcome.follow_ups {
            self.enqueue_follow_up(follow_up);
        }

        if !outcome.measurements.is_empty() {
            self.sink.insert(&outcome.measurements)?;
            self.state.measurements_emitted += outcome.measurements.len() as u64;
        }

        if outcome.zones_changed {
            self.snapshots.send_replace(self.store.snapshot());
        }
        Ok(())
    }

    fn enqueue_follow_up(&mut self, follow_up: FollowUp) {
        if let FollowUp::ZoneNameRepair { zone_id, .. } = &follow_up {
            if !self.repairs.try_acquire(*zone_id) {
                warn!(zone_id = *zone_id, "Repair limit reached for zone {}, not requeueing", zone_id);
                self.state.repairs_dropped = self.state.repairs_dropped.saturating_add(1);
                return;
            }
        }

        let command = follow_up.command().clone();
        match self.outbound_tx.try_enqueue(command) {
            Ok(()) => {
                if matches!(follow_up, FollowUp::ZoneNameRepair { .. }) {
                    self.state.repairs_queued = self.state.repairs_queued.saturating_add(1);
                }
                info!("Queued {} request", follow_up.command().command);
            }
            Err(OutboundError::QueueFull) | Err(OutboundError::QueueClosed) => {
                warn!("Outbound queue full, dropping {} request", follow_up.command().command);
                self.state.follow_ups_dropped = self.state.follow_ups_dropped.saturating_add(1);
                if let FollowUp::ZoneNameRepair { zone_id, .. } = follow_up {
                    self.repairs.give_back(zone_id);
                }
            }
        }
    }
}
