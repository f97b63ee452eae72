//! Periodic accumulated export of the zone model.
//!
//! Every few minutes the latest snapshot is condensed into a single
//! [`ZoneSummary`] row holding one entry per real zone that has reported both a
//! temperature and a heat demand.

use crate::measurement::SummarySink;
use crate::scheduler::apply_jitter;
use crate::zones::{ZoneRecord, ZoneSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_SUMMARY_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_SUMMARY_WARMUP: Duration = Duration::from_secs(150);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSummaryEntry {
    pub zone_id: u8,
    pub zone_name: Option<String>,
    pub temperature: f64,
    /// Only set while it lies strictly inside the zone's bounds.
    pub setpoint: Option<f64>,
    pub heat_demand: f64,
}

impl ZoneSummaryEntry {
    fn from_zone(zone: &ZoneRecord) -> Option<Self> {
        if !zone.is_actual_zone() {
            return None;
        }
        let temperature = zone.temperature.filter(|t| *t != 0.0)?;
        let heat_demand = zone.heat_demand.filter(|d| *d != 0.0)?;
        let setpoint = zone
            .setpoint
            .filter(|s| *s > zone.min_temperature && *s < zone.max_temperature);

        Some(Self {
            zone_id: zone.id,
            zone_name: zone.name().map(str::to_string),
            temperature,
            setpoint,
            heat_demand,
        })
    }
}

/// One accumulated export row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSummary {
    pub inserted_at: DateTime<Utc>,
    pub zones: Vec<ZoneSummaryEntry>,
}

impl ZoneSummary {
    pub fn from_snapshot(snapshot: &ZoneSnapshot) -> Self {
        Self {
            inserted_at: Utc::now(),
            zones: snapshot.iter().filter_map(ZoneSummaryEntry::from_zone).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

/// Waits `warmup`, then exports a summary of the latest snapshot every
/// `interval`. Both waits are jittered. Summaries with no qualifying zone are
/// skipped.
pub async fn run_summary_export<S: SummarySink>(
    mut sink: S,
    snapshots: watch::Receiver<ZoneSnapshot>,
    warmup: Duration,
    interval: Duration,
    jitter_percent: u8,
    cancel: CancellationToken,
) {
    let mut wait = apply_jitter(warmup, jitter_percent);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Summary export stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let summary = ZoneSummary::from_snapshot(&snapshots.borrow());
        if summary.is_empty() {
            debug!("No zone has a full set of readings yet, skipping summary");
        } else if let Err(e) = sink.insert_summary(&summary) {
            error!("Exporting zone summary failed: {}", e);
        } else {
            info!(zones = summary.zones.len(), "Exported zone summary");
        }

        wait = apply_jitter(interval, jitter_percent);
    }
}
