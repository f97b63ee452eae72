//! Byte transport to the HGI80 bridge.
//!
//! The bridge is a serial device that emits one telegram per CR/LF terminated line
//! and accepts outbound telegrams the same way. [`SerialTransport`] talks to real
//! hardware; [`MockTransport`] replays scripted lines for tests.

use crate::protocol::MAX_LINE_LENGTH;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, warn};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open {device}: {reason}")]
    OpenFailed { device: String, reason: String },
    #[error("transport is not connected")]
    NotConnected,
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("connection closed by peer")]
    Closed,
}

/// One line taken off the bus, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Complete(String),
    /// The line ran past the maximum length; only its head is kept.
    Truncated(String),
}

impl LineRead {
    pub fn text(&self) -> &str {
        match self {
            LineRead::Complete(line) | LineRead::Truncated(line) => line,
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, LineRead::Truncated(_))
    }
}

#[async_trait]
pub trait Transport: Send {
    /// Reads the next line, or `Ok(None)` when nothing completed within `wait`.
    ///
    /// Must be cancel-safe: bytes already received stay buffered for the next call.
    async fn read_line(&mut self, wait: Duration) -> Result<Option<LineRead>, TransportError>;

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Drops the current link and opens a fresh one.
    async fn reconnect(&mut self) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    fn describe(&self) -> String;
}

/// Splits a byte stream into bus lines, capping each at [`MAX_LINE_LENGTH`].
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete (or truncated) line, if the buffer holds one.
    pub fn next_line(&mut self) -> Option<LineRead> {
        loop {
            match self.pending.iter().position(|b| *b == b'\n') {
                Some(end) => {
                    let mut line: Vec<u8> = self.pending.drain(..=end).collect();
                    if self.discarding {
                        // tail of a line already reported as truncated
                        self.discarding = false;
                        continue;
                    }
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if line.len() > MAX_LINE_LENGTH {
                        line.truncate(MAX_LINE_LENGTH);
                        return Some(LineRead::Truncated(lossy(&line)));
                    }
                    return Some(LineRead::Complete(lossy(&line)));
                }
                None if !self.discarding && self.pending.len() > MAX_LINE_LENGTH => {
                    let head: Vec<u8> = self.pending.drain(..MAX_LINE_LENGTH).collect();
                    self.pending.clear();
                    self.discarding = true;
                    return Some(LineRead::Truncated(lossy(&head)));
                }
                None => {
                    if self.discarding {
                        self.pending.clear();
                    }
                    return None;
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.discarding = false;
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// HGI80 attached over USB serial, 8N1.
pub struct SerialTransport {
    device: String,
    baud_rate: u32,
    port: Option<SerialStream>,
    framer: LineFramer,
}

impl SerialTransport {
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            port: None,
            framer: LineFramer::new(),
        }
    }

    /// Creates the transport and opens the port.
    pub fn open(device: impl Into<String>, baud_rate: u32) -> Result<Self, TransportError> {
        let mut transport = Self::new(device, baud_rate);
        transport.connect()?;
        Ok(transport)
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        debug!("Opening serial port {} at {} baud", self.device, self.baud_rate);
        let port = tokio_serial::new(&self.device, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::OpenFailed {
                device: self.device.clone(),
                reason: e.to_string(),
            })?;

        self.port = Some(port);
        self.framer.clear();
        info!("Serial port {} open", self.device);
        Ok(())
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read_line(&mut self, wait: Duration) -> Result<Option<LineRead>, TransportError> {
        if let Some(line) = self.framer.next_line() {
            return Ok(Some(line));
        }
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        let deadline = Instant::now() + wait;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let read = match timeout(remaining, port.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(TransportError::ReadFailed(e.to_string())),
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => n,
            };
            self.framer.push(&chunk[..read]);
            if let Some(line) = self.framer.next_line() {
                return Ok(Some(line));
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.write_all(bytes)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        port.flush()
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            info!("Closed serial port {} for reconnect", self.device);
        }
        self.connect()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush().await {
                warn!("Flushing {} on close failed: {}", self.device, e);
            }
            info!("Closed serial port {}", self.device);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.device, self.baud_rate)
    }
}

/// Scripted event returned by [`MockTransport::read_line`].
#[derive(Debug, Clone)]
pub enum MockRead {
    Line(String),
    Fail(TransportError),
}

#[derive(Debug, Default)]
struct MockState {
    reads: VecDeque<MockRead>,
    written: Vec<String>,
    fail_writes: bool,
    reconnects: u32,
    closed: bool,
}

/// In-memory transport. Clones share the same script and write log.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    idle_wait: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            idle_wait: Duration::from_millis(5),
        }
    }

    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transport = Self::new();
        for line in lines {
            transport.push_line(line);
        }
        transport
    }

    pub fn push_line(&self, line: impl Into<String>) {
        self.with_state(|s| s.reads.push_back(MockRead::Line(line.into())));
    }

    pub fn push_failure(&self, error: TransportError) {
        self.with_state(|s| s.reads.push_back(MockRead::Fail(error)));
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.with_state(|s| s.fail_writes = fail);
    }

    /// Every line written so far, terminators included.
    pub fn written(&self) -> Vec<String> {
        self.with_state(|s| s.written.clone())
    }

    pub fn reconnects(&self) -> u32 {
        self.with_state(|s| s.reconnects)
    }

    pub fn is_drained(&self) -> bool {
        self.with_state(|s| s.reads.is_empty())
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_line(&mut self, wait: Duration) -> Result<Option<LineRead>, TransportError> {
        let next = self.with_state(|s| s.reads.pop_front());
        match next {
            Some(MockRead::Line(line)) if line.len() > MAX_LINE_LENGTH => {
                let mut framer = LineFramer::new();
                framer.push(line.as_bytes());
                framer.push(b"\n");
                Ok(framer.next_line())
            }
            Some(MockRead::Line(line)) => Ok(Some(LineRead::Complete(line))),
            Some(MockRead::Fail(e)) => Err(e),
            None => {
                tokio::time::sleep(wait.min(self.idle_wait)).await;
                Ok(None)
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.with_state(|s| {
            if s.fail_writes {
                return Err(TransportError::WriteFailed("mock write failure".into()));
            }
            s.written.push(String::from_utf8_lossy(bytes).into_owned());
            Ok(())
        })
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.with_state(|s| s.reconnects += 1);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.with_state(|s| s.closed = true);
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
