//! Userspace driver for Philips amBX gaming lights
//!
//! Discovery finds every amBX on the bus, opens a [`DeviceSession`] for each
//! and registers the ones that initialize as [`AmbxController`]s.
//!
//! # Example
//!
//! ```no_run
//! use ambx_common::RusbBackend;
//! use ambx_driver::{AmbxConfig, ControllerRegistry, Discovery};
//! use ambx_protocol::Rgb;
//!
//! let config = AmbxConfig::load_or_default();
//! let discovery = Discovery::new(RusbBackend, config.session);
//! let mut registry = ControllerRegistry::new();
//! discovery.scan(&mut registry)?;
//!
//! for controller in registry.iter_mut() {
//!     controller.set_all_zones(Rgb::new(0, 64, 255))?;
//! }
//! # Ok::<(), ambx_driver::DriverError>(())
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod usb;

pub use config::{AmbxConfig, GeneralSettings, SessionSettings};
pub use controller::{AmbxController, ControllerInfo, ControllerRegistry};
pub use error::{DriverError, Result, TransferError};
pub use usb::{ClaimPolicy, DeviceIdentity, DeviceSession, Discovery, DiscoveryReport};
