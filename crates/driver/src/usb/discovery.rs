//! amBX discovery
//!
//! Enumerates the bus once, opens a session for every amBX found and hands
//! the ones that initialize to a [`ControllerRegistry`].

use crate::config::SessionSettings;
use crate::controller::ControllerRegistry;
use crate::error::{DriverError, Result};
use crate::usb::session::{DeviceIdentity, DeviceSession};
use ambx_common::{UsbBackend, UsbBus, UsbDeviceRef};
use tracing::{debug, error, info, warn};

/// Outcome of one discovery pass
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// amBX devices seen on the bus
    pub matched: usize,
    /// Devices that initialized and were registered
    pub registered: usize,
    /// Devices that failed to open, with the reason
    pub failures: Vec<(DeviceIdentity, DriverError)>,
}

impl DiscoveryReport {
    /// Devices were found but none could be used
    pub fn all_failed(&self) -> bool {
        self.matched > 0 && self.registered == 0
    }
}

pub struct Discovery<B: UsbBackend> {
    backend: B,
    settings: SessionSettings,
}

impl<B: UsbBackend> Discovery<B> {
    pub fn new(backend: B, settings: SessionSettings) -> Self {
        Self { backend, settings }
    }

    /// amBX devices currently on the bus, without opening them
    pub fn find_devices(&self) -> Result<Vec<DeviceIdentity>> {
        let bus = self.backend.init().map_err(|e| {
            error!("Failed to initialize libusb: {}", e);
            DriverError::TransportInit(e)
        })?;

        let devices = bus.devices().map_err(|e| {
            error!("Failed to get USB device list: {}", e);
            DriverError::Enumeration(e)
        })?;

        let mut found = Vec::new();
        for device in &devices {
            let (vendor_id, product_id) = match device.vendor_product() {
                Ok(ids) => ids,
                Err(e) => {
                    debug!(
                        "Skipping device at {}-{}: descriptor unreadable: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if DeviceIdentity::is_ambx(vendor_id, product_id) {
                found.push(DeviceIdentity::ambx(device.bus_number(), device.address()));
            }
        }

        debug!("Enumerated {} devices, {} amBX", devices.len(), found.len());
        Ok(found)
    }

    /// Open every amBX and register the ones that initialize
    ///
    /// The scan context is released before any session opens; each session
    /// creates its own.
    pub fn scan(&self, registry: &mut ControllerRegistry<B>) -> Result<DiscoveryReport> {
        let identities = self.find_devices()?;
        let mut report = DiscoveryReport {
            matched: identities.len(),
            ..DiscoveryReport::default()
        };

        for identity in identities {
            match DeviceSession::open(&self.backend, identity, self.settings.clone()) {
                Ok(session) => {
                    registry.register(session);
                    report.registered += 1;
                }
                Err(e) => {
                    warn!("Skipping {}: {}", identity.location(), e);
                    report.failures.push((identity, e));
                }
            }
        }

        if report.all_failed() {
            error!(
                "Found {} amBX device(s) but none could be initialized",
                report.matched
            );
            if let Some(hint) = report.failures.iter().find_map(|(_, e)| e.remediation()) {
                error!("{}", hint);
            }
        } else {
            info!(
                "Discovery registered {}/{} amBX device(s)",
                report.registered, report.matched
            );
        }

        Ok(report)
    }
}
