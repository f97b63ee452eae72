//! Zone snapshot persistence and the periodic publisher task.

use crate::scheduler::apply_jitter;
use crate::zones::{default_snapshot, ZoneSnapshot};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is not a valid zone snapshot: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where zone snapshots are exported to and restored from.
pub trait ZoneSnapshotPublisher: Send {
    fn publish(&mut self, snapshot: &ZoneSnapshot) -> Result<(), StateError>;

    /// Previously published snapshot, or `None` if nothing was ever published.
    fn load(&mut self) -> Result<Option<ZoneSnapshot>, StateError>;
}

/// Keeps the snapshot as a pretty-printed JSON array in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot to seed the zone store with at startup.
    pub fn load_or_default(&mut self) -> Result<ZoneSnapshot, StateError> {
        Ok(self.load()?.unwrap_or_else(default_snapshot))
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ZoneSnapshotPublisher for JsonFileSnapshotStore {
    fn publish(&mut self, snapshot: &ZoneSnapshot) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(snapshot).map_err(|source| StateError::Format {
            path: self.path.clone(),
            source,
        })?;

        // Write beside the target and rename so readers never see a partial file.
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, json).map_err(|e| self.io_error(e))?;
        fs::rename(&staging, &self.path).map_err(|e| self.io_error(e))?;
        debug!(zones = snapshot.len(), "Published zone snapshot to {}", self.path.display());
        Ok(())
    }

    fn load(&mut self) -> Result<Option<ZoneSnapshot>, StateError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let snapshot = serde_json::from_str(&contents).map_err(|source| StateError::Format {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(snapshot))
    }
}

/// Publishes the latest snapshot from `updates` every `interval` (jittered), and
/// once more on shutdown. Unchanged snapshots are not re-published.
pub async fn run_snapshot_publisher<P: ZoneSnapshotPublisher>(
    mut publisher: P,
    mut updates: watch::Receiver<ZoneSnapshot>,
    interval: Duration,
    jitter_percent: u8,
    cancel: CancellationToken,
) {
    loop {
        let wait = apply_jitter(interval, jitter_percent);
        let stopping = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(wait) => false,
        };

        if updates.has_changed().unwrap_or(false) || stopping {
            let snapshot = updates.borrow_and_update().clone();
            if let Err(e) = publisher.publish(&snapshot) {
                error!("Publishing zone snapshot failed: {}", e);
            }
        }

        if stopping {
            info!("Snapshot publisher stopped");
            return;
        }
    }
}
