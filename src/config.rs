//! Listener settings: defaults, an optional JSON file, then command-line overrides.

use crate::protocol::DeviceAddress;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_GATEWAY: &str = "18:000730";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("controller address is required")]
    MissingController,
    #[error("invalid device address '{0}'")]
    InvalidAddress(String),
    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },
    #[error("jitter percent {0} must be below 100")]
    JitterTooLarge(u8),
    #[error("repair limit must be at least 1")]
    ZeroRepairLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub device: String,
    pub baud_rate: u32,
    pub controller: Option<DeviceAddress>,
    pub gateway: DeviceAddress,
    pub state_file: PathBuf,
    pub measurements_file: PathBuf,
    pub summary_file: PathBuf,
    pub refresh_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub link_timeout_secs: u64,
    pub snapshot_interval_secs: u64,
    pub summary_interval_secs: u64,
    pub summary_warmup_secs: u64,
    pub settle_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub reconnect_delay_secs: u64,
    pub repair_limit: u8,
    pub jitter_percent: u8,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: crate::transport::DEFAULT_BAUD_RATE,
            controller: None,
            gateway: default_gateway(),
            state_file: PathBuf::from("zones.json"),
            measurements_file: PathBuf::from("measurements.jsonl"),
            summary_file: PathBuf::from("zones_accumulated.jsonl"),
            refresh_interval_secs: 900,
            heartbeat_interval_secs: 300,
            health_check_interval_secs: 120,
            link_timeout_secs: 120,
            snapshot_interval_secs: 60,
            summary_interval_secs: crate::summary::DEFAULT_SUMMARY_INTERVAL.as_secs(),
            summary_warmup_secs: crate::summary::DEFAULT_SUMMARY_WARMUP.as_secs(),
            settle_delay_ms: 2000,
            read_timeout_ms: 2000,
            reconnect_delay_secs: 5,
            repair_limit: crate::outbound::DEFAULT_REPAIR_LIMIT,
            jitter_percent: crate::scheduler::DEFAULT_JITTER_PERCENT,
        }
    }
}

fn default_gateway() -> DeviceAddress {
    DeviceAddress::from_parts(18, 730)
}

impl ListenerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.is_none() {
            return Err(ConfigError::MissingController);
        }
        let intervals = [
            ("refresh_interval_secs", self.refresh_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("link_timeout_secs", self.link_timeout_secs),
            ("snapshot_interval_secs", self.snapshot_interval_secs),
            ("summary_interval_secs", self.summary_interval_secs),
            ("read_timeout_ms", self.read_timeout_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval { field });
            }
        }
        if self.jitter_percent >= 100 {
            return Err(ConfigError::JitterTooLarge(self.jitter_percent));
        }
        if self.repair_limit == 0 {
            return Err(ConfigError::ZeroRepairLimit);
        }
        Ok(())
    }

    /// Validated controller address.
    pub fn controller(&self) -> Result<DeviceAddress, ConfigError> {
        self.controller.ok_or(ConfigError::MissingController)
    }

    pub fn set_controller(&mut self, address: &str) -> Result<(), ConfigError> {
        self.controller = Some(parse_address(address)?);
        Ok(())
    }

    pub fn set_gateway(&mut self, address: &str) -> Result<(), ConfigError> {
        self.gateway = parse_address(address)?;
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_secs(self.link_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.summary_interval_secs)
    }

    pub fn summary_warmup(&self) -> Duration {
        Duration::from_secs(self.summary_warmup_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

fn parse_address(address: &str) -> Result<DeviceAddress, ConfigError> {
    address
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(address.to_string()))
}
