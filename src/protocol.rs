//! Wire grammar for the bridge's line protocol.
//!
//! Inbound lines look like
//!
//! ```text
//! 045 RP --- 01:160371 18:010057 --:------ 0004 022 06004C6F676565726B616D6572000000000000000000
//! ```
//!
//! and outbound lines are the same grammar without the leading counter, with the
//! bridge's own address in the source slot.

use crate::catalog::{CommandCatalog, CommandName};
use arrayvec::ArrayString;
use core::fmt::Write;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Shortest line that still carries every fixed field (through the length field).
pub const MIN_LINE_LENGTH: usize = 49;
pub const MAX_LINE_LENGTH: usize = 512;
pub const NULL_ADDRESS: &str = "--:------";

/// Markers the bridge inserts when it could not decrypt or receive a frame.
const FAILURE_MARKERS: [&str; 4] = ["_ENC", "_BAD", "BAD_", "ERR"];

const GRAMMAR: &str = r"^(\d{3}) ( I| W|RQ|RP) --- ([0-9A-Fa-f]{2}:\d{6}) (--:------|[0-9A-Fa-f]{2}:\d{6}) (--:------|[0-9A-Fa-f]{2}:\d{6}) ([0-9A-Fa-f]{4}) (\S{3})(?: (.*))?$";

pub type WireLine = ArrayString<MAX_LINE_LENGTH>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Information,
    Write,
    Request,
    Response,
}

impl MessageType {
    /// Trimmed form, as stored on decoded telegrams.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Information => "I",
            MessageType::Write => "W",
            MessageType::Request => "RQ",
            MessageType::Response => "RP",
        }
    }

    /// Two-character, right-aligned form used on the wire.
    pub fn wire(self) -> &'static str {
        match self {
            MessageType::Information => " I",
            MessageType::Write => " W",
            MessageType::Request => "RQ",
            MessageType::Response => "RP",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "I" => Ok(MessageType::Information),
            "W" => Ok(MessageType::Write),
            "RQ" => Ok(MessageType::Request),
            "RP" => Ok(MessageType::Response),
            other => Err(ProtocolError::InvalidMessageType(other.to_string())),
        }
    }
}

/// A bus address such as `01:160371`: a two-digit device type and a six-digit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress {
    type_code: ArrayString<2>,
    id: ArrayString<6>,
}

impl DeviceAddress {
    /// Address from numeric parts, e.g. `(18, 730)` is `18:000730`.
    pub fn from_parts(device_type: u8, id: u32) -> Self {
        let mut type_code = ArrayString::new();
        let mut digits = ArrayString::new();
        // both fit their capacity after the modulo
        let _ = write!(type_code, "{:02}", device_type % 100);
        let _ = write!(digits, "{:06}", id % 1_000_000);
        Self {
            type_code,
            id: digits,
        }
    }

    pub fn type_code(&self) -> &str {
        &self.type_code
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_code, self.id)
    }
}

impl FromStr for DeviceAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidAddress(s.to_string());
        let (type_code, id) = s.split_once(':').ok_or_else(invalid)?;

        if type_code.len() != 2 || !type_code.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        if id.len() != 6 || !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        Ok(Self {
            type_code: ArrayString::from(type_code).map_err(|_| invalid())?,
            id: ArrayString::from(id).map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.to_string()
    }
}

/// Immutable decode of one inbound line.
#[derive(Debug, Clone, PartialEq)]
pub struct Telegram {
    pub raw: String,
    pub message_type: MessageType,
    pub source: DeviceAddress,
    pub source_type: &'static str,
    pub destination: DeviceAddress,
    pub destination_type: &'static str,
    pub broadcast: bool,
    pub command_code: ArrayString<4>,
    pub command: CommandName,
    pub payload_length: usize,
    pub payload: String,
}

impl Telegram {
    /// `CTL:160371`-style label used in log fields.
    pub fn source_label(&self) -> String {
        format!("{}:{}", self.source_type, self.source.id())
    }

    pub fn destination_label(&self) -> String {
        format!("{}:{}", self.destination_type, self.destination.id())
    }

    pub fn is_from_controller(&self) -> bool {
        self.source_type == "CTL"
    }
}

/// Raw bytes of an outbound payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    bytes: Vec<u8>,
}

impl Payload {
    pub fn new(bytes: &[u8]) -> Self {
        Self { bytes: bytes.to_vec() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Uppercase hex; an empty payload renders as a single zero byte.
    pub fn to_hex(&self) -> String {
        if self.bytes.is_empty() {
            return "00".to_string();
        }
        hex::encode_upper(&self.bytes)
    }
}

/// An outbound telegram waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub message_type: MessageType,
    pub command: CommandName,
    pub destination: DeviceAddress,
    pub broadcast: bool,
    pub payload: Payload,
}

impl PendingCommand {
    pub fn request(command: CommandName, destination: DeviceAddress, payload: &[u8]) -> Self {
        Self {
            message_type: MessageType::Request,
            command,
            destination,
            broadcast: false,
            payload: Payload::new(payload),
        }
    }

    pub fn zone_name_request(controller: DeviceAddress, zone_id: u8) -> Self {
        Self::request(CommandName::ZoneName, controller, &[zone_id, 0])
    }

    pub fn zone_info_request(controller: DeviceAddress, zone_id: u8) -> Self {
        Self::request(CommandName::ZoneInfo, controller, &[zone_id])
    }

    pub fn device_info_request(controller: DeviceAddress, device_index: u8) -> Self {
        Self::request(CommandName::DeviceInfo, controller, &[0, 0, device_index])
    }

    pub fn heartbeat_request(controller: DeviceAddress) -> Self {
        Self::request(CommandName::Heartbeat, controller, &[0])
    }

    pub fn controller_mode_request(controller: DeviceAddress) -> Self {
        Self::request(CommandName::ControllerMode, controller, &[0xFF])
    }
}

/// Splits raw lines into [`Telegram`]s.
#[derive(Debug, Clone)]
pub struct TelegramParser {
    grammar: Regex,
    catalog: Arc<CommandCatalog>,
}

impl TelegramParser {
    pub fn new(catalog: Arc<CommandCatalog>) -> Result<Self, ProtocolError> {
        Ok(Self {
            grammar: Regex::new(GRAMMAR)?,
            catalog,
        })
    }

    pub fn parse(&self, line: &str) -> Result<Telegram, ProtocolError> {
        let line = line.trim_end();
        if line.len() < MIN_LINE_LENGTH {
            return Err(ProtocolError::TooShort { length: line.len() });
        }
        if FAILURE_MARKERS.iter().any(|marker| line.contains(marker)) {
            return Err(ProtocolError::FailureMarker);
        }

        let captures = self
            .grammar
            .captures(line)
            .ok_or(ProtocolError::GrammarMismatch)?;
        let field = |index: usize| captures.get(index).map_or("", |m| m.as_str());

        let message_type: MessageType = field(2).parse()?;
        let source: DeviceAddress = field(3).parse()?;
        let destination = match (field(4), field(5)) {
            (NULL_ADDRESS, NULL_ADDRESS) => return Err(ProtocolError::AddressLayout),
            (NULL_ADDRESS, third) => third.parse::<DeviceAddress>()?,
            (second, NULL_ADDRESS) => second.parse::<DeviceAddress>()?,
            _ => return Err(ProtocolError::AddressLayout),
        };

        let command_code =
            ArrayString::from(field(6)).map_err(|_| ProtocolError::GrammarMismatch)?;
        let payload_length = field(7).parse::<usize>().unwrap_or(0);

        Ok(Telegram {
            raw: line.to_string(),
            message_type,
            source_type: self.catalog.name_for_device_type_code(source.type_code()),
            destination_type: self
                .catalog
                .name_for_device_type_code(destination.type_code()),
            broadcast: source == destination,
            source,
            destination,
            command: self.catalog.name_for_command_code(&command_code),
            command_code,
            payload_length,
            payload: field(8).trim().to_string(),
        })
    }
}

/// Renders [`PendingCommand`]s back into the wire grammar.
#[derive(Debug, Clone)]
pub struct TelegramEncoder {
    catalog: Arc<CommandCatalog>,
    gateway: DeviceAddress,
}

impl TelegramEncoder {
    pub fn new(catalog: Arc<CommandCatalog>, gateway: DeviceAddress) -> Self {
        Self { catalog, gateway }
    }

    pub fn gateway(&self) -> DeviceAddress {
        self.gateway
    }

    pub fn encode(&self, command: &PendingCommand) -> Result<WireLine, ProtocolError> {
        let code = self
            .catalog
            .code_for_command_name(command.command)
            .ok_or(ProtocolError::UnencodableCommand(command.command))?;
        let payload = command.payload.to_hex();
        let payload_length = payload.len() / 2;

        let mut line = WireLine::new();
        let written = if command.broadcast {
            write!(
                line,
                "{} --- {} {} {} {} {:03} {}",
                command.message_type.wire(),
                self.gateway,
                NULL_ADDRESS,
                self.gateway,
                code,
                payload_length,
                payload
            )
        } else {
            write!(
                line,
                "{} --- {} {} {} {} {:03} {}",
                command.message_type.wire(),
                self.gateway,
                command.destination,
                NULL_ADDRESS,
                code,
                payload_length,
                payload
            )
        };
        written.map_err(|_| ProtocolError::MessageTooLarge)?;

        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("line too short ({length} characters)")]
    TooShort { length: usize },
    #[error("line carries a bridge failure marker")]
    FailureMarker,
    #[error("line does not match the telegram grammar")]
    GrammarMismatch,
    #[error("exactly one trailing address slot must be null")]
    AddressLayout,
    #[error("invalid device address: {0}")]
    InvalidAddress(String),
    #[error("invalid message type: {0}")]
    InvalidMessageType(String),
    #[error("command {0} has no wire code")]
    UnencodableCommand(CommandName),
    #[error("encoded line exceeds the maximum line length")]
    MessageTooLarge,
    #[error("invalid grammar pattern: {0}")]
    InvalidPattern(String),
}

impl From<regex::Error> for ProtocolError {
    fn from(error: regex::Error) -> Self {
        ProtocolError::InvalidPattern(error.to_string())
    }
}
