//! # Smartcontrol
//!
//! Local control of zTC1-style six-outlet smart plugs over two transports:
//! UDP broadcast for discovery and provisioning, MQTT once a plug knows its
//! broker. Commands that tolerate either transport try MQTT first and fall
//! back to a UDP broadcast.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smartcontrol::{ConnParams, ControllerBuilder};
//!
//! # async fn run() -> smartcontrol::Result<()> {
//! let controller = ControllerBuilder::new(ConnParams::new("192.168.1.2", 1883)).build();
//! let device = controller.discover().await?;
//! let outcome = controller.switch(&device.mac, 2, true).await?;
//! println!("{}", outcome);
//! # Ok(())
//! # }
//! ```
//!
pub mod config;
pub mod controller;
pub mod envelope;
pub mod error;
pub mod mqtt;
pub mod transport;
pub mod udp;

#[cfg(test)]
mod testing;

pub use config::{ConnParams, Settings, UdpConfig};
pub use controller::{Controller, ControllerBuilder, SwitchOutcome};
pub use envelope::{DeviceReport, PlugIndex, PlugState, PowerReading};
pub use error::{ControlError, Result};
pub use mqtt::{MqttChannel, MqttTransport, Topic};
pub use transport::Delivery;
pub use udp::{UdpChannel, UdpTransport};

/// Crate version, reported by the CLI's `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
