//! Measurement rows and the sinks they are written to.

use crate::protocol::Telegram;
use crate::summary::ZoneSummary;
use crate::zones::ZoneRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Default bound on rows kept while the downstream sink is failing.
pub const DEFAULT_RETRY_CAPACITY: usize = 4096;

/// One row emitted by a payload decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub message_type: String,
    pub command: String,
    pub source_type: String,
    pub source_id: String,
    pub destination_type: String,
    pub destination_id: String,
    pub broadcast: bool,
    pub zone_id: Option<u8>,
    pub zone_name: Option<String>,
    pub temperature: Option<f64>,
    pub setpoint: Option<f64>,
    pub demand_percentage: Option<f64>,
    pub inserted_at: DateTime<Utc>,
}

impl Measurement {
    /// Row carrying the telegram's metadata and the zone's identity, with no readings.
    pub fn for_zone(telegram: &Telegram, zone: &ZoneRecord) -> Self {
        Self {
            message_type: telegram.message_type.as_str().to_string(),
            command: telegram.command.as_str().to_string(),
            source_type: telegram.source_type.to_string(),
            source_id: telegram.source.id().to_string(),
            destination_type: telegram.destination_type.to_string(),
            destination_id: telegram.destination.id().to_string(),
            broadcast: telegram.broadcast,
            zone_id: Some(zone.id),
            zone_name: zone.name().map(str::to_string),
            temperature: None,
            setpoint: None,
            demand_percentage: None,
            inserted_at: Utc::now(),
        }
    }

    pub fn with_temperature(mut self, value: f64) -> Self {
        self.temperature = Some(value);
        self
    }

    pub fn with_setpoint(mut self, value: f64) -> Self {
        self.setpoint = Some(value);
        self
    }

    pub fn with_demand_percentage(mut self, value: f64) -> Self {
        self.demand_percentage = Some(value);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error writing measurements to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize measurement: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("retry buffer full, {dropped} measurements cannot be kept")]
    BufferOverflow { dropped: usize },
}

/// Destination for emitted measurement rows.
pub trait MeasurementSink: Send {
    fn insert(&mut self, rows: &[Measurement]) -> Result<(), SinkError>;

    /// Delivers anything still held back. Called once on shutdown.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Rows accepted by `insert` but not yet delivered.
    fn pending(&self) -> usize {
        0
    }
}

/// Destination for the periodic accumulated zone export.
pub trait SummarySink: Send {
    fn insert_summary(&mut self, summary: &ZoneSummary) -> Result<(), SinkError>;
}

/// Appends each row as one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn write_rows<T: Serialize>(&mut self, rows: &[T]) -> Result<(), SinkError> {
        for row in rows {
            let line = serde_json::to_string(row)?;
            self.writer
                .write_all(line.as_bytes())
                .and_then(|()| self.writer.write_all(b"\n"))
                .map_err(|source| SinkError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        }
        self.writer.flush().map_err(|source| SinkError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl MeasurementSink for JsonLinesSink {
    fn insert(&mut self, rows: &[Measurement]) -> Result<(), SinkError> {
        self.write_rows(rows)
    }
}

impl SummarySink for JsonLinesSink {
    fn insert_summary(&mut self, summary: &ZoneSummary) -> Result<(), SinkError> {
        self.write_rows(std::slice::from_ref(summary))
    }
}

/// Collects rows in memory; used by the offline decoder and tests.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    rows: Vec<Measurement>,
    summaries: Vec<ZoneSummary>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[Measurement] {
        &self.rows
    }

    pub fn take(&mut self) -> Vec<Measurement> {
        core::mem::take(&mut self.rows)
    }

    pub fn summaries(&self) -> &[ZoneSummary] {
        &self.summaries
    }
}

impl MeasurementSink for MemorySink {
    fn insert(&mut self, rows: &[Measurement]) -> Result<(), SinkError> {
        self.rows.extend_from_slice(rows);
        Ok(())
    }
}

impl SummarySink for MemorySink {
    fn insert_summary(&mut self, summary: &ZoneSummary) -> Result<(), SinkError> {
        self.summaries.push(summary.clone());
        Ok(())
    }
}

/// Keeps rows a failing sink rejected and retries them ahead of newer rows.
///
/// Rows are only released once the inner sink accepted them, so delivery is
/// at-least-once. When the backlog would exceed `capacity` the insert fails with
/// [`SinkError::BufferOverflow`] and the caller decides whether that is fatal.
#[derive(Debug)]
pub struct BufferedSink<S> {
    inner: S,
    pending: VecDeque<Measurement>,
    capacity: usize,
}

impl<S: MeasurementSink> BufferedSink<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            capacity,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: MeasurementSink> MeasurementSink for BufferedSink<S> {
    fn insert(&mut self, rows: &[Measurement]) -> Result<(), SinkError> {
        if self.pending.len() + rows.len() > self.capacity {
            error!(
                pending = self.pending.len(),
                incoming = rows.len(),
                capacity = self.capacity,
                "Measurement retry buffer exhausted"
            );
            return Err(SinkError::BufferOverflow { dropped: rows.len() });
        }
        self.pending.extend(rows.iter().cloned());

        if let Err(e) = self.flush() {
            warn!(pending = self.pending.len(), "Inserting measurements failed, keeping them for retry: {}", e);
        }
        Ok(())
    }

    /// Retries the backlog without adding rows.
    fn flush(&mut self) -> Result<(), SinkError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let backlog: Vec<Measurement> = self.pending.iter().cloned().collect();
        self.inner.insert(&backlog)?;
        self.pending.clear();
        Ok(())
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CommandCatalog;
    use crate::protocol::TelegramParser;
    use std::sync::Arc;

    struct FlakySink {
        failures_left: usize,
        accepted: Vec<Measurement>,
    }

    impl MeasurementSink for FlakySink {
        fn insert(&mut self, rows: &[Measurement]) -> Result<(), SinkError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(SinkError::Unavailable("warehouse offline".into()));
            }
            self.accepted.extend_from_slice(rows);
            Ok(())
        }
    }

    fn sample_row(zone_id: u8) -> Measurement {
        let parser = TelegramParser::new(Arc::new(CommandCatalog::new())).unwrap();
        let telegram = parser
            .parse("045  I --- 01:160371 --:------ 01:160371 30C9 003 000824")
            .unwrap();
        Measurement::for_zone(&telegram, &ZoneRecord::new(zone_id)).with_temperature(20.84)
    }

    #[test]
    fn test_buffered_sink_retries_in_order() {
        let flaky = FlakySink { failures_left: 1, accepted: Vec::new() };
        let mut sink = BufferedSink::new(flaky, 16);

        sink.insert(&[sample_row(0)]).unwrap();
        assert_eq!(sink.pending(), 1);

        sink.insert(&[sample_row(1)]).unwrap();
        assert_eq!(sink.pending(), 0);

        let zones: Vec<Option<u8>> = sink.inner().accepted.iter().map(|m| m.zone_id).collect();
        assert_eq!(zones, vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_buffered_sink_overflow() {
        let flaky = FlakySink { failures_left: usize::MAX, accepted: Vec::new() };
        let mut sink = BufferedSink::new(flaky, 2);

        sink.insert(&[sample_row(0), sample_row(1)]).unwrap();
        let result = sink.insert(&[sample_row(2)]);
        assert!(matches!(result, Err(SinkError::BufferOverflow { dropped: 1 })));
        assert_eq!(sink.pending(), 2);
    }

    #[test]
    fn test_buffered_sink_flush_delivers_backlog() {
        let flaky = FlakySink { failures_left: 1, accepted: Vec::new() };
        let mut sink = BufferedSink::new(flaky, 16);

        sink.insert(&[sample_row(0), sample_row(5)]).unwrap();
        assert_eq!(sink.pending(), 2);

        sink.flush().unwrap();
        assert_eq!(sink.pending(), 0);
        assert_eq!(sink.inner().accepted.len(), 2);

        // nothing left to deliver
        sink.flush().unwrap();
        assert_eq!(sink.inner().accepted.len(), 2);
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("measurements.jsonl");

        let mut sink = JsonLinesSink::open(&path).unwrap();
        sink.insert(&[sample_row(0), sample_row(3)]).unwrap();
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<Measurement> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].zone_id, Some(3));
        assert_eq!(rows[0].temperature, Some(20.84));
    }
}
