//! # evobus
//!
//! Listener for the Evohome heating RF bus, attached through an HGI80 serial bridge.
//!
//! ## Features
//!
//! - **Telegram parsing**: fixed-offset wire grammar with address/type resolution
//! - **Payload decoding**: zone names, bounds, temperatures, setpoints and heat demand
//! - **Live zone model**: sanity-checked zone records exported as periodic snapshots
//! - **Controller polling**: jittered refresh, heartbeat and device walk requests
//! - **Link supervision**: idle detection with reconnect on the owning loop
//! - **Accumulated export**: periodic per-zone summary rows
//!
//! ## Quick Start
//!
//! ```rust
//! use evobus::{decode, CommandCatalog, TelegramParser, ZoneStore};
//! use std::sync::Arc;
//!
//! let parser = TelegramParser::new(Arc::new(CommandCatalog::new())).unwrap();
//! let mut store = ZoneStore::new();
//!
//! let telegram = parser
//!     .parse("045  I --- 01:160371 --:------ 01:160371 30C9 006 0008020B0834")
//!     .unwrap();
//! let outcome = decode(&telegram, &mut store);
//!
//! assert_eq!(outcome.measurements.len(), 2);
//! assert_eq!(store.get(0).and_then(|z| z.temperature), Some(20.5));
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Line grammar, telegrams and the outbound encoder
//! - [`catalog`] - Command and device type code tables
//! - [`decoders`] - Per-command payload decoders
//! - [`zones`] - Zone records and their invariants
//! - [`outbound`] - Request queue, dispatcher and repair budget
//! - [`scheduler`] - Periodic refresh, heartbeat and link health check
//! - [`listener`] - The main loop tying transport, decode and sinks together
//! - [`summary`] - Periodic accumulated zone export
//! - [`transport`], [`measurement`], [`state`] - Collaborator seams

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod catalog;
pub mod config;
pub mod decoders;
pub mod listener;
pub mod measurement;
pub mod outbound;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod summary;
pub mod transport;
pub mod zones;

// Re-export main public types for convenience
pub use catalog::{CommandCatalog, CommandName};
pub use config::ListenerConfig;
pub use decoders::{decode, DecodeOutcome};
pub use listener::{BusListener, ListenerError, ListenerHandles, ListenerSettings};
pub use measurement::{Measurement, MeasurementSink};
pub use protocol::{DeviceAddress, PendingCommand, Telegram, TelegramEncoder, TelegramParser};
pub use zones::{ZoneRecord, ZoneStore};
