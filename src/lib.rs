#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Sabers
//!
//! Discovery, state sync and control of RGB saber stands over Bluetooth Low
//! Energy.
//!
//! Saber stands advertise a single custom service and put their current
//! state in the manufacturer data of every advertisement: one power byte
//! and three colour bytes. This crate scans for stands, tracks them in an
//! ordered registry and sends power and colour commands, each as a
//! connect, write, disconnect sequence.
//!
//! ## Layout
//!
//! - [`codec`] and [`protocol`]: byte-level encoding, advertisement
//!   parsing and the per-platform constant table
//! - [`registry`]: the ordered, de-duplicated peripheral list a UI renders
//! - [`scan`]: scan sessions with a safety timeout
//! - [`sequencer`]: per-stand command sequencing with colour coalescing
//! - [`monitor`]: adapter state tracking and settings prompts
//! - [`radio`]: the [`Radio`] capability the above run against
//! - [`ble`]: [`BtleplugRadio`], the `btleplug` implementation
//! - [`manager`]: [`SaberManager`], which wires everything together
//!
//! ## Platform differences
//!
//! CoreBluetooth and Android frame manufacturer data differently and list
//! GATT services in a different order. Pick the [`Platform`] whose
//! conventions the radio backend follows; [`Platform::current`] guesses
//! from the compile target.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sabers::{BtleplugRadio, ManagerConfig, Platform, SaberManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let radio = Arc::new(BtleplugRadio::new(Platform::current()).await?);
//!     let manager = Arc::new(SaberManager::new(radio, ManagerConfig::default()));
//!     let _active = manager.activate();
//!
//!     manager.start_scan().await?;
//!     let mut scanning = manager.watch_scanning();
//!     while *scanning.borrow_and_update() {
//!         scanning.changed().await?;
//!     }
//!
//!     for stand in manager.peripherals().await {
//!         println!("{} power={} color={}", stand.name, stand.power, stand.color);
//!         manager.set_power(&stand.id, true).await?;
//!     }
//!     Ok(())
//! }
//! ```

/// `btleplug` radio backend
pub mod ble;
/// Hex codec for characteristic payloads
pub mod codec;
/// Error types and handling
pub mod error;
/// UI-facing entry point
pub mod manager;
pub mod monitor;
/// Saber stand wire format and platform constants
pub mod protocol;
pub mod radio;
/// Discovered peripheral registry
pub mod registry;
/// Scan session control
pub mod scan;
/// Command sequencing against single stands
pub mod sequencer;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod fake;

// Re-export the main types for convenient usage
pub use ble::BtleplugRadio;
pub use error::{Result, SaberError};
pub use manager::{Activation, ManagerConfig, SaberManager};
pub use monitor::{Prompter, RadioMonitor, SettingsPrompt};
pub use radio::{Radio, RadioEvent};
pub use sequencer::{ColorDispatch, CommandSequencer};
pub use types::{
    CommandPhase, Peripheral, PeripheralId, Platform, RadioStatus, ScanOutcome, ScanParams,
    ScanState, TimeoutConfig,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service UUID advertised by saber stands
pub const SABER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_004a_0000_1000_8000_0080_5f9b_34fb);

/// Display name of stands that advertise no name
pub const DEFAULT_PERIPHERAL_NAME: &str = "NO NAME";
