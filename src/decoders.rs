//! Payload decoders, one per command name.
//!
//! [`handler_for`] is a total mapping from [`CommandName`] to a decoder. A decoder
//! either accepts the telegram, validating the whole payload before touching the
//! [`ZoneStore`], or returns a [`DecodeError`], in which case [`decode`] hands the
//! telegram to the logging-only fallback.

use crate::catalog::CommandName;
use crate::measurement::Measurement;
use crate::protocol::{MessageType, PendingCommand, Telegram};
use crate::zones::{clean_zone_name, demand_percentage, ZoneRecord, ZoneRejection, ZoneStore};
use tracing::{debug, info, warn};

pub const ZONE_NAME_PAYLOAD_BYTES: usize = 22;
pub const DEVICE_INFO_PAYLOAD_BYTES: usize = 22;
pub const HEAT_DEMAND_PAYLOAD_BYTES: usize = 2;
const ZONE_INFO_BLOCK_BYTES: usize = 6;
const CENTI_BLOCK_BYTES: usize = 3;

/// Request a decoder wants sent as a consequence of what it saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// The zone's name could not be decoded; ask for it again.
    ZoneNameRepair { zone_id: u8, command: PendingCommand },
    /// Next step of the controller's device walk.
    DeviceWalk(PendingCommand),
}

impl FollowUp {
    pub fn command(&self) -> &PendingCommand {
        match self {
            FollowUp::ZoneNameRepair { command, .. } | FollowUp::DeviceWalk(command) => command,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeOutcome {
    pub measurements: Vec<Measurement>,
    pub follow_ups: Vec<FollowUp>,
    /// Set when at least one zone record was written.
    pub zones_changed: bool,
    /// Zone whose name was decoded successfully.
    pub named_zone: Option<u8>,
    /// Set when the telegram ended up in the fallback handler.
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("decoder does not apply: {0}")]
    NotApplicable(&'static str),
    #[error("payload length {declared} (hex length {actual}) does not fit block size {block}")]
    PayloadShape {
        declared: usize,
        actual: usize,
        block: usize,
    },
    #[error("payload is not valid hex: {0}")]
    InvalidHex(String),
}

pub type Handler = fn(&Telegram, &mut ZoneStore) -> Result<DecodeOutcome, DecodeError>;

/// Handler table. Names without a decoder map to the fallback.
pub fn handler_for(command: CommandName) -> Handler {
    match command {
        CommandName::ZoneName => decode_zone_name,
        CommandName::ZoneInfo => decode_zone_info,
        CommandName::ZoneTemperature => decode_zone_temperature,
        CommandName::Setpoint => decode_setpoint,
        CommandName::ZoneHeatDemand | CommandName::RelayHeatDemand => decode_heat_demand,
        CommandName::DeviceInfo => decode_device_info,
        CommandName::ExternalSensor
        | CommandName::ScheduleSync
        | CommandName::OtherCommand
        | CommandName::BatteryInfo
        | CommandName::DhwSettings
        | CommandName::Heartbeat
        | CommandName::DhwTemperature
        | CommandName::WindowStatus
        | CommandName::Sync
        | CommandName::DhwState
        | CommandName::Bind
        | CommandName::SetpointUfh
        | CommandName::SetpointOverride
        | CommandName::ControllerMode
        | CommandName::DateRequest
        | CommandName::ActuatorCheckReq
        | CommandName::ActuatorState
        | CommandName::Unknown => decode_fallback,
    }
}

/// Runs the telegram's decoder, falling back to logging when it does not apply.
pub fn decode(telegram: &Telegram, store: &mut ZoneStore) -> DecodeOutcome {
    let handler = handler_for(telegram.command);
    match handler(telegram, store) {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(command = %telegram.command, "{}, routing to fallback", e);
            fallback(telegram)
        }
    }
}

fn decode_fallback(telegram: &Telegram, _store: &mut ZoneStore) -> Result<DecodeOutcome, DecodeError> {
    Ok(fallback(telegram))
}

fn fallback(telegram: &Telegram) -> DecodeOutcome {
    debug!(
        msg = %telegram.raw,
        source = %telegram.source_label(),
        target = %telegram.destination_label(),
        "{}",
        telegram.command
    );
    DecodeOutcome {
        fallback: true,
        ..DecodeOutcome::default()
    }
}

fn decode_zone_name(telegram: &Telegram, store: &mut ZoneStore) -> Result<DecodeOutcome, DecodeError> {
    require_controller(telegram)?;
    if telegram.message_type != MessageType::Response {
        return Err(DecodeError::NotApplicable("zone name is only decoded from responses"));
    }
    if telegram.payload_length != ZONE_NAME_PAYLOAD_BYTES || telegram.payload.len() < 4 {
        return Err(shape_error(telegram, ZONE_NAME_PAYLOAD_BYTES));
    }

    // byte 0 zone id, byte 1 reserved, bytes 2.. the name
    let zone_id = telegram
        .payload
        .get(0..2)
        .ok_or_else(|| DecodeError::InvalidHex(telegram.payload.clone()))
        .and_then(hex_u8)?;
    let mut outcome = DecodeOutcome::default();

    let bytes = match telegram.payload.get(4..).map(hex::decode) {
        Some(Ok(bytes)) => bytes,
        _ => {
            warn!(zone_id, msg = %telegram.raw, "Retrieving name for zone {} failed, retrying...", zone_id);
            outcome.follow_ups.push(FollowUp::ZoneNameRepair {
                zone_id,
                command: PendingCommand::zone_name_request(telegram.source, zone_id),
            });
            return Ok(outcome);
        }
    };

    match clean_zone_name(&String::from_utf8_lossy(&bytes)) {
        Some(name) => {
            let zone = store.record_name(zone_id, name);
            info!(
                msg = %telegram.raw,
                source = %telegram.source_label(),
                target = %telegram.destination_label(),
                zone = ?zone,
                "{}",
                telegram.command
            );
            outcome.zones_changed = true;
            outcome.named_zone = Some(zone_id);
        }
        None => {
            info!(zone_id, msg = %telegram.raw, "Zone {} has no name", zone_id);
        }
    }

    Ok(outcome)
}

fn decode_zone_info(telegram: &Telegram, store: &mut ZoneStore) -> Result<DecodeOutcome, DecodeError> {
    require_controller(telegram)?;
    require_not_request(telegram)?;

    // blocks of (zone id, flags, min, max), offsets in hex characters
    let blocks = payload_blocks(telegram, ZONE_INFO_BLOCK_BYTES)?
        .into_iter()
        .map(|block| -> Result<(u8, f64, f64), DecodeError> {
            Ok((
                hex_u8(&block[0..2])?,
                centi_degrees(&block[4..8])?,
                centi_degrees(&block[8..12])?,
            ))
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    let mut outcome = DecodeOutcome::default();
    for (zone_id, min, max) in blocks {
        match store.record_bounds(zone_id, min, max) {
            Ok(zone) => {
                info!(
                    msg = %telegram.raw,
                    source = %telegram.source_label(),
                    target = %telegram.destination_label(),
                    zone = ?zone,
                    "{}",
                    telegram.command
                );
                outcome.zones_changed = true;
            }
            Err(rejection) => warn_rejected(telegram, zone_id, rejection),
        }
    }

    Ok(outcome)
}

fn decode_zone_temperature(
    telegram: &Telegram,
    store: &mut ZoneStore,
) -> Result<DecodeOutcome, DecodeError> {
    decode_centi_blocks(
        telegram,
        store,
        ZoneStore::record_temperature,
        Measurement::with_temperature,
    )
}

fn decode_setpoint(telegram: &Telegram, store: &mut ZoneStore) -> Result<DecodeOutcome, DecodeError> {
    decode_centi_blocks(telegram, store, ZoneStore::record_setpoint, Measurement::with_setpoint)
}

fn decode_centi_blocks(
    telegram: &Telegram,
    store: &mut ZoneStore,
    apply: fn(&mut ZoneStore, u8, f64) -> Result<&ZoneRecord, ZoneRejection>,
    attach: fn(Measurement, f64) -> Measurement,
) -> Result<DecodeOutcome, DecodeError> {
    require_controller(telegram)?;
    require_not_request(telegram)?;

    // blocks of (zone id, value in centi-degrees)
    let blocks = payload_blocks(telegram, CENTI_BLOCK_BYTES)?
        .into_iter()
        .map(|block| -> Result<(u8, f64), DecodeError> {
            Ok((hex_u8(&block[0..2])?, centi_degrees(&block[2..6])?))
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    let mut outcome = DecodeOutcome::default();
    for (zone_id, value) in blocks {
        match apply(store, zone_id, value) {
            Ok(zone) => {
                info!(
                    msg = %telegram.raw,
                    source = %telegram.source_label(),
                    target = %telegram.destination_label(),
                    zone = ?zone,
                    "{}",
                    telegram.command
                );
                outcome.zones_changed = true;
                if zone.is_reportable() {
                    outcome
                        .measurements
                        .push(attach(Measurement::for_zone(telegram, zone), value));
                }
            }
            Err(rejection) => warn_rejected(telegram, zone_id, rejection),
        }
    }

    Ok(outcome)
}

fn decode_heat_demand(telegram: &Telegram, store: &mut ZoneStore) -> Result<DecodeOutcome, DecodeError> {
    if telegram.payload_length != HEAT_DEMAND_PAYLOAD_BYTES {
        return Err(shape_error(telegram, HEAT_DEMAND_PAYLOAD_BYTES));
    }
    let block = payload_blocks(telegram, HEAT_DEMAND_PAYLOAD_BYTES)?
        .into_iter()
        .next()
        .ok_or_else(|| shape_error(telegram, HEAT_DEMAND_PAYLOAD_BYTES))?;
    let zone_id = hex_u8(&block[0..2])?;
    let raw = hex_u8(&block[2..4])?;

    let mut outcome = DecodeOutcome::default();
    match store.record_heat_demand(zone_id, raw) {
        Ok(zone) => {
            info!(
                msg = %telegram.raw,
                source = %telegram.source_label(),
                target = %telegram.destination_label(),
                zone = ?zone,
                "{}",
                telegram.command
            );
            outcome.zones_changed = true;
            if zone.is_reportable() {
                outcome.measurements.push(
                    Measurement::for_zone(telegram, zone)
                        .with_demand_percentage(demand_percentage(raw)),
                );
            }
        }
        Err(rejection) => warn_rejected(telegram, zone_id, rejection),
    }

    Ok(outcome)
}

fn decode_device_info(telegram: &Telegram, _store: &mut ZoneStore) -> Result<DecodeOutcome, DecodeError> {
    require_controller(telegram)?;
    if telegram.message_type != MessageType::Response {
        return Err(DecodeError::NotApplicable("device info is only decoded from responses"));
    }
    if telegram.payload_length != DEVICE_INFO_PAYLOAD_BYTES {
        return Err(shape_error(telegram, DEVICE_INFO_PAYLOAD_BYTES));
    }
    let payload = payload_blocks(telegram, DEVICE_INFO_PAYLOAD_BYTES)?
        .into_iter()
        .next()
        .ok_or_else(|| shape_error(telegram, DEVICE_INFO_PAYLOAD_BYTES))?;

    let address = hex_u8(&payload[4..6])?;
    let index = hex_u8(&payload[10..12])?;
    let device_id = u32::from_str_radix(&payload[38..44], 16)
        .map_err(|_| DecodeError::InvalidHex(payload[38..44].to_string()))?;

    info!(
        msg = %telegram.raw,
        source = %telegram.source_label(),
        target = %telegram.destination_label(),
        address,
        index,
        device_id,
        "{}",
        telegram.command
    );

    let mut outcome = DecodeOutcome::default();
    if device_id == 0 {
        info!(address, "Device walk finished");
        return Ok(outcome);
    }

    match address.checked_add(1) {
        Some(next) => {
            info!("Queueing device_info command for device {}", next);
            outcome.follow_ups.push(FollowUp::DeviceWalk(PendingCommand::device_info_request(
                telegram.source,
                next,
            )));
        }
        None => warn!(address, "Device walk reached the last address without a terminator"),
    }

    Ok(outcome)
}

fn require_controller(telegram: &Telegram) -> Result<(), DecodeError> {
    if telegram.is_from_controller() {
        Ok(())
    } else {
        Err(DecodeError::NotApplicable("source is not a controller"))
    }
}

fn require_not_request(telegram: &Telegram) -> Result<(), DecodeError> {
    if telegram.message_type == MessageType::Request {
        Err(DecodeError::NotApplicable("requests carry no readings"))
    } else {
        Ok(())
    }
}

/// Splits the payload into blocks of `block_bytes`, checking the declared length,
/// the actual hex length and the digits up front.
fn payload_blocks(telegram: &Telegram, block_bytes: usize) -> Result<Vec<&str>, DecodeError> {
    let declared = telegram.payload_length;
    let payload = telegram.payload.as_str();
    if declared == 0 || declared % block_bytes != 0 || payload.len() != declared * 2 {
        return Err(shape_error(telegram, block_bytes));
    }
    if !payload.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidHex(payload.to_string()));
    }

    let block_chars = block_bytes * 2;
    Ok((0..payload.len())
        .step_by(block_chars)
        .map(|start| &payload[start..start + block_chars])
        .collect())
}

fn shape_error(telegram: &Telegram, block: usize) -> DecodeError {
    DecodeError::PayloadShape {
        declared: telegram.payload_length,
        actual: telegram.payload.len(),
        block,
    }
}

fn hex_u8(digits: &str) -> Result<u8, DecodeError> {
    u8::from_str_radix(digits, 16).map_err(|_| DecodeError::InvalidHex(digits.to_string()))
}

fn centi_degrees(digits: &str) -> Result<f64, DecodeError> {
    u16::from_str_radix(digits, 16)
        .map(|value| f64::from(value) / 100.0)
        .map_err(|_| DecodeError::InvalidHex(digits.to_string()))
}

fn warn_rejected(telegram: &Telegram, zone_id: u8, rejection: ZoneRejection) {
    warn!(
        msg = %telegram.raw,
        source = %telegram.source_label(),
        target = %telegram.destination_label(),
        command = %telegram.command,
        zone_id,
        "Zone value rejected, not processing: {}",
        rejection
    );
}
