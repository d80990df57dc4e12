//! Common utilities for the amBX driver
//!
//! This crate provides the USB backend seam used by the driver (traits with
//! rusb implementations), logging setup, shared error handling, and an
//! in-memory USB backend for tests (`test-utils` feature).

pub mod error;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{RusbBackend, UsbBackend, UsbBus, UsbDeviceHandle, UsbDeviceRef};
