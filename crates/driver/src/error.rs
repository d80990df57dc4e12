//! Driver error types

use ambx_protocol::ProtocolError;
use thiserror::Error;

/// Failure of a single packet transfer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// libusb reported an error; nothing is known to have reached the device
    #[error("Failed to send interrupt transfer: {0}")]
    Usb(#[from] rusb::Error),

    /// The transfer succeeded but only part of the packet went out
    #[error("Failed to send complete packet: {sent}/{expected} bytes sent")]
    Partial { sent: usize, expected: usize },
}

impl TransferError {
    pub fn is_partial(&self) -> bool {
        matches!(self, TransferError::Partial { .. })
    }
}

/// Errors raised by sessions, discovery and controllers
#[derive(Debug, Error)]
pub enum DriverError {
    /// libusb context could not be created
    #[error("Failed to initialize libusb: {0}")]
    TransportInit(#[source] rusb::Error),

    /// Bus listing failed
    #[error("Failed to get USB device list: {0}")]
    Enumeration(#[source] rusb::Error),

    /// The device disappeared between discovery and open
    #[error("No amBX device found at {location}")]
    DeviceNotFound { location: String },

    /// Device present but could not be opened
    #[error("Failed to open amBX device at {location}: {source}")]
    Open {
        location: String,
        #[source]
        source: rusb::Error,
    },

    /// Interface held elsewhere after every retry
    #[error("Failed to claim interface {interface} after {attempts} attempt(s): {source}")]
    Claim {
        interface: u8,
        attempts: u32,
        #[source]
        source: rusb::Error,
    },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Caller supplied zones or colors the protocol cannot express
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// LED index outside the controller layout
    #[error("LED index {0} is out of range")]
    LedIndex(usize),

    /// Zone index outside the controller layout
    #[error("Zone index {0} is out of range")]
    ZoneIndex(usize),

    /// The session has been closed or never finished opening
    #[error("amBX session is not initialized")]
    NotInitialized,
}

const FOREIGN_DRIVER_HINT: &str = "The amBX appears to be held by another driver (possibly the original Jungo/WinDriver). \
     On Windows, install the WinUSB driver for this device using Zadig. \
     On Linux, make sure no other program has the device open and that a udev rule grants access to 0471:083f.";

const PERMISSION_HINT: &str = "Access to the amBX was denied. \
     On Linux, add a udev rule such as SUBSYSTEM==\"usb\", ATTRS{idVendor}==\"0471\", ATTRS{idProduct}==\"083f\", MODE=\"0666\". \
     On Windows, replace the vendor driver with WinUSB using Zadig.";

impl DriverError {
    /// Actionable guidance for errors the user can fix
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            DriverError::Open {
                source: rusb::Error::Access,
                ..
            } => Some(PERMISSION_HINT),
            DriverError::Open {
                source: rusb::Error::Busy,
                ..
            }
            | DriverError::Claim { .. } => Some(FOREIGN_DRIVER_HINT),
            _ => None,
        }
    }

    /// The whole discovery pass cannot continue
    pub fn is_fatal_for_pass(&self) -> bool {
        matches!(
            self,
            DriverError::TransportInit(_) | DriverError::Enumeration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
