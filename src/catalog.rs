use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Device type name used when a type code is not in the catalog.
pub const UNKNOWN_DEVICE_TYPE: &str = "NA";

/// Semantic command kinds carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    ExternalSensor,
    ZoneName,
    ScheduleSync,
    RelayHeatDemand,
    ZoneInfo,
    OtherCommand,
    DeviceInfo,
    BatteryInfo,
    DhwSettings,
    Heartbeat,
    DhwTemperature,
    WindowStatus,
    Sync,
    DhwState,
    Bind,
    SetpointUfh,
    Setpoint,
    SetpointOverride,
    ControllerMode,
    ZoneTemperature,
    DateRequest,
    ZoneHeatDemand,
    ActuatorCheckReq,
    ActuatorState,
    Unknown,
}

impl CommandName {
    /// Every name that has a wire code, in catalog order.
    pub const KNOWN: [CommandName; 24] = [
        CommandName::ExternalSensor,
        CommandName::ZoneName,
        CommandName::ScheduleSync,
        CommandName::RelayHeatDemand,
        CommandName::ZoneInfo,
        CommandName::OtherCommand,
        CommandName::DeviceInfo,
        CommandName::BatteryInfo,
        CommandName::DhwSettings,
        CommandName::Heartbeat,
        CommandName::DhwTemperature,
        CommandName::WindowStatus,
        CommandName::Sync,
        CommandName::DhwState,
        CommandName::Bind,
        CommandName::SetpointUfh,
        CommandName::Setpoint,
        CommandName::SetpointOverride,
        CommandName::ControllerMode,
        CommandName::ZoneTemperature,
        CommandName::DateRequest,
        CommandName::ZoneHeatDemand,
        CommandName::ActuatorCheckReq,
        CommandName::ActuatorState,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandName::ExternalSensor => "external_sensor",
            CommandName::ZoneName => "zone_name",
            CommandName::ScheduleSync => "schedule_sync",
            CommandName::RelayHeatDemand => "relay_heat_demand",
            CommandName::ZoneInfo => "zone_info",
            CommandName::OtherCommand => "other_command",
            CommandName::DeviceInfo => "device_info",
            CommandName::BatteryInfo => "battery_info",
            CommandName::DhwSettings => "dhw_settings",
            CommandName::Heartbeat => "heartbeat",
            CommandName::DhwTemperature => "dhw_temperature",
            CommandName::WindowStatus => "window_status",
            CommandName::Sync => "sync",
            CommandName::DhwState => "dhw_state",
            CommandName::Bind => "bind",
            CommandName::SetpointUfh => "setpoint_ufh",
            CommandName::Setpoint => "setpoint",
            CommandName::SetpointOverride => "setpoint_override",
            CommandName::ControllerMode => "controller_mode",
            CommandName::ZoneTemperature => "zone_temperature",
            CommandName::DateRequest => "date_request",
            CommandName::ZoneHeatDemand => "zone_heat_demand",
            CommandName::ActuatorCheckReq => "actuator_check_req",
            CommandName::ActuatorState => "actuator_state",
            CommandName::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = UnknownCommandName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandName::KNOWN
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownCommandName(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command name: {0}")]
pub struct UnknownCommandName(pub String);

// Lowercase command codes. The reverse map is derived from this table at construction.
const COMMAND_CODES: [(&str, CommandName); 24] = [
    ("0002", CommandName::ExternalSensor),
    ("0004", CommandName::ZoneName),
    ("0006", CommandName::ScheduleSync),
    ("0008", CommandName::RelayHeatDemand),
    ("000a", CommandName::ZoneInfo),
    ("0100", CommandName::OtherCommand),
    ("0418", CommandName::DeviceInfo),
    ("1060", CommandName::BatteryInfo),
    ("10a0", CommandName::DhwSettings),
    ("10e0", CommandName::Heartbeat),
    ("1260", CommandName::DhwTemperature),
    ("12b0", CommandName::WindowStatus),
    ("1f09", CommandName::Sync),
    ("1f41", CommandName::DhwState),
    ("1fc9", CommandName::Bind),
    ("22c9", CommandName::SetpointUfh),
    ("2309", CommandName::Setpoint),
    ("2349", CommandName::SetpointOverride),
    ("2e04", CommandName::ControllerMode),
    ("30c9", CommandName::ZoneTemperature),
    ("313f", CommandName::DateRequest),
    ("3150", CommandName::ZoneHeatDemand),
    ("3b00", CommandName::ActuatorCheckReq),
    ("3ef0", CommandName::ActuatorState),
];

const DEVICE_TYPES: [(&str, &str); 7] = [
    ("01", "CTL"),
    ("02", "UFH"),
    ("04", "TRV"),
    ("07", "DHW"),
    ("13", "BDR"),
    ("30", "GWAY"),
    ("34", "STAT"),
];

/// Bidirectional lookup between wire codes and names.
///
/// Built once at startup and shared read-only (usually behind an `Arc`).
#[derive(Debug, Clone)]
pub struct CommandCatalog {
    names_by_code: HashMap<String, CommandName>,
    codes_by_name: HashMap<CommandName, String>,
    device_types: HashMap<&'static str, &'static str>,
}

impl CommandCatalog {
    pub fn new() -> Self {
        let names_by_code: HashMap<String, CommandName> = COMMAND_CODES
            .iter()
            .map(|(code, name)| ((*code).to_string(), *name))
            .collect();
        let codes_by_name = invert(&names_by_code);

        Self {
            names_by_code,
            codes_by_name,
            device_types: DEVICE_TYPES.iter().copied().collect(),
        }
    }

    /// Resolve a 4-digit hex code (any case). Unmapped codes resolve to `Unknown`.
    pub fn name_for_command_code(&self, code: &str) -> CommandName {
        self.names_by_code
            .get(&code.to_ascii_lowercase())
            .copied()
            .unwrap_or(CommandName::Unknown)
    }

    /// Uppercase wire code for a name; `None` for `Unknown`.
    pub fn code_for_command_name(&self, name: CommandName) -> Option<String> {
        self.codes_by_name
            .get(&name)
            .map(|code| code.to_ascii_uppercase())
    }

    pub fn name_for_device_type_code(&self, code: &str) -> &'static str {
        self.device_types
            .get(code)
            .copied()
            .unwrap_or(UNKNOWN_DEVICE_TYPE)
    }

    pub fn command_count(&self) -> usize {
        self.names_by_code.len()
    }
}

impl Default for CommandCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn invert(forward: &HashMap<String, CommandName>) -> HashMap<CommandName, String> {
    forward
        .iter()
        .map(|(code, name)| (*name, code.clone()))
        .collect()
}
