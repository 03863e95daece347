#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Relaylink
//!
//! A Rust library for discovering, connecting to and configuring WiFi relay
//! appliances over Bluetooth Low Energy.
//!
//! The relay exposes one GATT service with three or four characteristics that
//! together form a byte pipe for a small text protocol:
//!
//! - **`CommandIn`**: bare ASCII control words such as `GETSSIDLIST` or `CONNECTWIFI`
//! - **`DataIn`**: arguments for the next command (SSID, password, settings)
//! - **`DataOut`**: results (`ssid|rssi|channel;...`, settings, saved networks)
//! - **`StatusOut`**: connection status text (absent on generation-two hardware)
//!
//! The firmware never acknowledges a write, so every operation is a fixed
//! sequence of writes separated by pacing delays, optionally followed by a read
//! whose value is correlated back to the waiting operation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use relaylink::{DeviceSettings, RelayDevice};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Discover and connect to the nearest relay
//!     let relay = RelayDevice::connect_first().await?;
//!
//!     // Point it at an upstream network
//!     let outcome = relay.connect_wifi("Home", "correct horse").await?;
//!     println!("{}", outcome.status);
//!
//!     // Rename its access point
//!     relay
//!         .write_settings(&DeviceSettings::new("Relay-AP", "battery staple", 6, 3))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Other transports
//!
//! The engine only needs a [`Link`]. [`RelayDevice::attach`] drives any
//! implementation, which is how the engine is tested without a radio.

/// Bluetooth Low Energy transport built on btleplug
pub mod ble;
/// Response correlation between requests and notifications
pub mod correlator;
/// Main device control interface
pub mod device;
/// Error types and handling
pub mod error;
/// Transport abstraction consumed by the engine
pub mod link;
/// Command vocabulary and payload encoding/decoding
pub mod protocol;
/// Ordered, paced execution of protocol operations
pub mod sequencer;
/// Connection lifecycle state
pub mod session;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{BleLink, BleManager};
pub use device::RelayDevice;
pub use error::{RelayError, Result};
pub use link::{Link, LinkEvent};
pub use protocol::Command;
pub use types::{
    CharacteristicRole, ConnectionOutcome, ConnectionParams, DeviceEvent, DeviceInfo,
    DeviceSettings, PacingConfig, RelayConfig, RoleMap, ScannedNetwork, SessionState,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Relay service UUID on generation-one hardware
pub const GEN1_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Generation-one command characteristic (write)
pub const GEN1_COMMAND_IN_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Generation-one data input characteristic (write)
pub const GEN1_DATA_IN_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a9);

/// Generation-one data output characteristic (read, notify)
pub const GEN1_DATA_OUT_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26aa);

/// Generation-one status characteristic (read, notify)
pub const GEN1_STATUS_OUT_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26ab);

/// Relay service UUID on generation-two hardware
///
/// Generation two has no status characteristic; status text arrives on
/// [`GEN2_DATA_OUT_UUID`].
pub const GEN2_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Generation-two command characteristic (write)
pub const GEN2_COMMAND_IN_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Generation-two data output characteristic (read, notify)
pub const GEN2_DATA_OUT_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Generation-two data input characteristic (write)
pub const GEN2_DATA_IN_UUID: Uuid = Uuid::from_u128(0x6e400004_b5a3_f393_e0a9_e50e24dcca9e);
