//! Live model of the heating zones seen on the bus.
//!
//! The store is the only owner of zone knowledge. Every write goes through the decode
//! path on the listener's main loop; periodic tasks only ever see [`ZoneSnapshot`]s.

use heapless::String as BoundedString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Zone ids below this are real zones; the rest are controller pseudo-zones.
pub const ZONE_COUNT: u8 = 12;
pub const ZONE_NAME_CAPACITY: usize = 20;
/// Temperatures and setpoints above this are treated as corrupt.
pub const SANITY_CEILING_DEGREES: f64 = 100.0;
pub const OPENTHERM_ZONE_ID: u8 = 252;

pub type ZoneName = BoundedString<ZONE_NAME_CAPACITY>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub id: u8,
    pub name: Option<ZoneName>,
    /// 0 means not yet reported by the controller.
    pub min_temperature: f64,
    /// 0 means not yet reported by the controller.
    pub max_temperature: f64,
    pub temperature: Option<f64>,
    pub setpoint: Option<f64>,
    pub heat_demand: Option<f64>,
}

impl ZoneRecord {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            name: None,
            min_temperature: 0.0,
            max_temperature: 0.0,
            temperature: None,
            setpoint: None,
            heat_demand: None,
        }
    }

    pub fn is_actual_zone(&self) -> bool {
        self.id < ZONE_COUNT
    }

    pub fn bounds_known(&self) -> bool {
        self.min_temperature != 0.0 && self.max_temperature != 0.0
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Measurements for a zone are only worth emitting once it can be attributed.
    pub fn is_reportable(&self) -> bool {
        self.is_actual_zone() || self.name.is_some()
    }

    fn merge(&mut self, update: ZoneUpdate) {
        if let Some(name) = update.name {
            self.name = Some(name);
        }
        if let Some(min) = update.min_temperature {
            self.min_temperature = min;
        }
        if let Some(max) = update.max_temperature {
            self.max_temperature = max;
        }
        if let Some(temperature) = update.temperature {
            self.temperature = Some(temperature);
        }
        if let Some(setpoint) = update.setpoint {
            self.setpoint = Some(setpoint);
        }
        if let Some(demand) = update.heat_demand {
            self.heat_demand = Some(demand);
        }
    }
}

/// Partial update; `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneUpdate {
    pub name: Option<ZoneName>,
    pub min_temperature: Option<f64>,
    pub max_temperature: Option<f64>,
    pub temperature: Option<f64>,
    pub setpoint: Option<f64>,
    pub heat_demand: Option<f64>,
}

/// Why a decoded value was not applied.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum ZoneRejection {
    #[error("{value} exceeds the sanity ceiling")]
    AboveCeiling { value: f64 },
    #[error("setpoint {value} outside bounds ({min}, {max})")]
    OutsideBounds { value: f64, min: f64, max: f64 },
    #[error("bounds min {min} / max {max} are implausible")]
    InvalidBounds { min: f64, max: f64 },
    #[error("heat demand raw value {raw} exceeds 200")]
    DemandOutOfRange { raw: u8 },
}

/// Ordered copy of every zone record, for export.
pub type ZoneSnapshot = Vec<ZoneRecord>;

#[derive(Debug, Default, Clone)]
pub struct ZoneStore {
    zones: BTreeMap<u8, ZoneRecord>,
}

impl ZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded from a previously published snapshot.
    pub fn from_snapshot(snapshot: ZoneSnapshot) -> Self {
        let mut store = Self::new();
        store.seed(snapshot);
        store
    }

    pub fn seed(&mut self, snapshot: ZoneSnapshot) {
        for record in snapshot {
            self.zones.insert(record.id, record);
        }
    }

    pub fn get(&self, zone_id: u8) -> Option<&ZoneRecord> {
        self.zones.get(&zone_id)
    }

    pub fn upsert(&mut self, zone_id: u8, update: ZoneUpdate) -> &ZoneRecord {
        let record = self
            .zones
            .entry(zone_id)
            .or_insert_with(|| ZoneRecord::new(zone_id));
        record.merge(update);
        record
    }

    pub fn snapshot(&self) -> ZoneSnapshot {
        self.zones.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn record_name(&mut self, zone_id: u8, name: ZoneName) -> &ZoneRecord {
        self.upsert(
            zone_id,
            ZoneUpdate {
                name: Some(name),
                ..ZoneUpdate::default()
            },
        )
    }

    pub fn record_bounds(
        &mut self,
        zone_id: u8,
        min: f64,
        max: f64,
    ) -> Result<&ZoneRecord, ZoneRejection> {
        if max > SANITY_CEILING_DEGREES || min > max {
            return Err(ZoneRejection::InvalidBounds { min, max });
        }
        Ok(self.upsert(
            zone_id,
            ZoneUpdate {
                min_temperature: Some(min),
                max_temperature: Some(max),
                ..ZoneUpdate::default()
            },
        ))
    }

    pub fn record_temperature(
        &mut self,
        zone_id: u8,
        value: f64,
    ) -> Result<&ZoneRecord, ZoneRejection> {
        check_ceiling(value)?;
        Ok(self.upsert(
            zone_id,
            ZoneUpdate {
                temperature: Some(value),
                ..ZoneUpdate::default()
            },
        ))
    }

    /// Applies a setpoint, honouring the zone's bounds once they are known.
    pub fn record_setpoint(
        &mut self,
        zone_id: u8,
        value: f64,
    ) -> Result<&ZoneRecord, ZoneRejection> {
        check_ceiling(value)?;
        if let Some(record) = self.zones.get(&zone_id) {
            if record.bounds_known()
                && !(value > record.min_temperature && value < record.max_temperature)
            {
                return Err(ZoneRejection::OutsideBounds {
                    value,
                    min: record.min_temperature,
                    max: record.max_temperature,
                });
            }
        }
        Ok(self.upsert(
            zone_id,
            ZoneUpdate {
                setpoint: Some(value),
                ..ZoneUpdate::default()
            },
        ))
    }

    /// `raw` is the bus value in half-percent steps (0-200).
    pub fn record_heat_demand(&mut self, zone_id: u8, raw: u8) -> Result<&ZoneRecord, ZoneRejection> {
        if raw > 200 {
            return Err(ZoneRejection::DemandOutOfRange { raw });
        }
        Ok(self.upsert(
            zone_id,
            ZoneUpdate {
                heat_demand: Some(demand_percentage(raw)),
                ..ZoneUpdate::default()
            },
        ))
    }
}

pub fn demand_percentage(raw: u8) -> f64 {
    f64::from(raw) / 200.0 * 100.0
}

fn check_ceiling(value: f64) -> Result<(), ZoneRejection> {
    if value > SANITY_CEILING_DEGREES {
        return Err(ZoneRejection::AboveCeiling { value });
    }
    Ok(())
}

/// Snapshot used when no state has been published yet.
pub fn default_snapshot() -> ZoneSnapshot {
    let mut opentherm = ZoneRecord::new(OPENTHERM_ZONE_ID);
    let mut name = ZoneName::new();
    // fits within ZONE_NAME_CAPACITY
    let _ = name.push_str("Opentherm");
    opentherm.name = Some(name);
    vec![opentherm]
}

/// Builds a zone name from free text, keeping ASCII letters and spaces only.
pub fn clean_zone_name(raw: &str) -> Option<ZoneName> {
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || *c == ' ')
        .collect();
    let trimmed = filtered.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut name = ZoneName::new();
    for c in trimmed.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    Some(name)
}
