//! amBX device session
//!
//! A [`DeviceSession`] owns everything acquired for one physical device: its
//! own USB context, the opened handle and the interface claim. Opening either
//! yields a fully initialized session or releases whatever was acquired and
//! returns the error.
//!
//! Teardown runs in a fixed order, and every step runs even when an earlier
//! one failed:
//! 1. switch all lights off (errors and panics are logged and swallowed)
//! 2. release the claimed interface
//! 3. reattach a kernel driver we detached
//! 4. close the handle
//! 5. tear down the context

use crate::config::SessionSettings;
use crate::error::{DriverError, Result};
use crate::usb::transport::{INTERFACE, Transport};
use ambx_common::{UsbBackend, UsbBus, UsbDeviceHandle, UsbDeviceRef};
use ambx_protocol::{
    AMBX_PID, AMBX_VID, BatchHeaders, ColorCommand, Packet, Rgb, Zone, all_lights, encode_single,
    plan_packets,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where a device sits on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
}

impl DeviceIdentity {
    /// An amBX at `bus_number`/`address`
    pub fn ambx(bus_number: u8, address: u8) -> Self {
        Self {
            vendor_id: AMBX_VID,
            product_id: AMBX_PID,
            bus_number,
            address,
        }
    }

    /// Whether a vendor/product pair is an amBX
    pub const fn is_ambx(vendor_id: u16, product_id: u16) -> bool {
        vendor_id == AMBX_VID && product_id == AMBX_PID
    }

    /// Short path, e.g. `3-7`
    pub fn path(&self) -> String {
        format!("{}-{}", self.bus_number, self.address)
    }

    /// Human-readable location, e.g. `USB amBX: Bus 3 Addr 7`
    pub fn location(&self) -> String {
        format!("USB amBX: Bus {} Addr {}", self.bus_number, self.address)
    }

    fn matches<D: UsbDeviceRef>(&self, device: &D) -> bool {
        device.bus_number() == self.bus_number
            && device.address() == self.address
            && device
                .vendor_product()
                .is_ok_and(|ids| ids == (self.vendor_id, self.product_id))
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} at {}",
            self.vendor_id,
            self.product_id,
            self.path()
        )
    }
}

/// How long the control interface stays claimed
///
/// Both policies claim once while opening, so a device held by a foreign
/// driver never initializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimPolicy {
    /// Claim at open, release at teardown
    #[default]
    Hold,
    /// Claim before each packet and release right after
    PerOperation,
}

/// Claim retry parameters (fixed delay between attempts)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRetry {
    pub attempts: u32,
    pub delay: Duration,
}

type HandleOf<B> = <<<B as UsbBackend>::Bus as UsbBus>::Device as UsbDeviceRef>::Handle;

/// Handle plus claim state; the two only change together
struct OpenDevice<H> {
    transport: Transport<H>,
    claimed: bool,
    kernel_driver_detached: bool,
}

impl<H: UsbDeviceHandle> OpenDevice<H> {
    fn detach_kernel_driver(&mut self, location: &str) {
        let handle = self.transport.handle_mut();
        match handle.kernel_driver_active(INTERFACE) {
            Ok(true) => match handle.detach_kernel_driver(INTERFACE) {
                Ok(()) => {
                    debug!("Detached kernel driver from interface {} on {}", INTERFACE, location);
                    self.kernel_driver_detached = true;
                }
                Err(e) => warn!(
                    "Failed to detach kernel driver from interface {} on {}: {}",
                    INTERFACE, location, e
                ),
            },
            Ok(false) => debug!("No kernel driver active on interface {}", INTERFACE),
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                INTERFACE, e
            ),
        }
    }

    fn claim(&mut self, retry: ClaimRetry, location: &str) -> Result<()> {
        if self.claimed {
            return Ok(());
        }

        let attempts = retry.attempts.max(1);
        let mut last_error = rusb::Error::Other;

        for attempt in 1..=attempts {
            match self.transport.handle_mut().claim_interface(INTERFACE) {
                Ok(()) => {
                    self.claimed = true;
                    debug!("Claimed interface {} on {}", INTERFACE, location);
                    return Ok(());
                }
                Err(rusb::Error::NoDevice) => {
                    last_error = rusb::Error::NoDevice;
                    warn!("{} disappeared while claiming interface {}", location, INTERFACE);
                    break;
                }
                Err(rusb::Error::Busy) => {
                    last_error = rusb::Error::Busy;
                    warn!("Interface is busy - attempt {}/{}", attempt, attempts);
                }
                Err(e) => {
                    last_error = e;
                    warn!(
                        "Failed to claim interface {} - attempt {}/{}: {}",
                        INTERFACE, attempt, attempts, e
                    );
                }
            }

            if attempt < attempts {
                thread::sleep(retry.delay);
            }
        }

        let err = DriverError::Claim {
            interface: INTERFACE,
            attempts,
            source: last_error,
        };
        error!("{} on {}", err, location);
        if let Some(hint) = err.remediation() {
            error!("{}", hint);
        }
        Err(err)
    }

    fn release(&mut self) -> rusb::Result<()> {
        if !self.claimed {
            return Ok(());
        }
        // The claim is gone either way once release has been attempted
        self.claimed = false;
        self.transport.handle_mut().release_interface(INTERFACE)
    }
}

/// One opened amBX
pub struct DeviceSession<B: UsbBackend> {
    identity: DeviceIdentity,
    serial: String,
    settings: SessionSettings,
    headers: BatchHeaders,
    initialized: bool,
    device: Option<OpenDevice<HandleOf<B>>>,
    bus: Option<B::Bus>,
}

impl<B: UsbBackend> DeviceSession<B> {
    /// Open and claim the amBX at `identity`
    ///
    /// On failure every resource acquired so far has been released by the
    /// time this returns.
    pub fn open(backend: &B, identity: DeviceIdentity, settings: SessionSettings) -> Result<Self> {
        let location = identity.location();

        let bus = backend.init().map_err(|e| {
            error!("Failed to initialize libusb: {}", e);
            DriverError::TransportInit(e)
        })?;

        let mut session = Self {
            identity,
            serial: String::new(),
            headers: settings.batch_headers(),
            settings,
            initialized: false,
            device: None,
            bus: Some(bus),
        };

        let handle = session.open_handle(&location)?;
        let mut device = OpenDevice {
            transport: Transport::new(handle).with_timeout(session.settings.transfer_timeout()),
            claimed: false,
            kernel_driver_detached: false,
        };

        if session.settings.detach_kernel_driver {
            device.detach_kernel_driver(&location);
        }

        // Hand the device to the session before claiming so a failed claim
        // still goes through the ordered teardown
        let device = session.device.insert(device);
        device.claim(session.settings.claim_retry(), &location)?;

        if session.settings.claim_policy == ClaimPolicy::PerOperation {
            if let Err(e) = device.release() {
                warn!("Failed to release probe claim on {}: {}", location, e);
            }
        }

        session.serial = device.transport.handle().serial_number().unwrap_or_default();
        session.initialized = true;

        info!(
            "Opened {} (serial: {}, claim policy: {:?})",
            location,
            if session.serial.is_empty() { "none" } else { session.serial.as_str() },
            session.settings.claim_policy
        );

        if session.settings.blank_on_open {
            if let Err(e) = session.set_all_zones(Rgb::OFF) {
                warn!("Failed to turn off lights on {} after open: {}", location, e);
            }
        }

        Ok(session)
    }

    fn open_handle(&self, location: &str) -> Result<HandleOf<B>> {
        let bus = self.bus.as_ref().ok_or(DriverError::NotInitialized)?;
        let devices = bus.devices().map_err(|e| {
            error!("Failed to get USB device list: {}", e);
            DriverError::Enumeration(e)
        })?;

        let device = devices
            .iter()
            .find(|device| self.identity.matches(*device))
            .ok_or_else(|| DriverError::DeviceNotFound {
                location: location.to_string(),
            })?;

        device.open().map_err(|source| {
            let err = DriverError::Open {
                location: location.to_string(),
                source,
            };
            warn!("{}", err);
            if let Some(hint) = err.remediation() {
                warn!("{}", hint);
            }
            err
        })
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn location(&self) -> String {
        self.identity.location()
    }

    /// Serial number string, empty when the device has none
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_interface_claimed(&self) -> bool {
        self.device.as_ref().is_some_and(|device| device.claimed)
    }

    /// Switch lights off at teardown or leave them as they are
    pub fn set_blank_on_close(&mut self, blank: bool) {
        self.settings.blank_on_close = blank;
    }

    /// Set one zone, including the [`Zone::All`] broadcast id
    pub fn set_zone_color(&mut self, zone: Zone, color: Rgb) -> Result<()> {
        self.ensure_initialized()?;
        let packet = encode_single(&ColorCommand::new(zone, color));
        self.send_and_pace(&packet)
    }

    /// Set one zone by raw wire id
    pub fn set_zone_color_raw(&mut self, zone_id: u8, color: Rgb) -> Result<()> {
        let cmd = ColorCommand::from_raw(zone_id, color)?;
        self.set_zone_color(cmd.zone, cmd.color)
    }

    /// Set the five physical lights in one batch packet
    pub fn set_all_zones(&mut self, color: Rgb) -> Result<()> {
        self.apply(&all_lights(color))
    }

    /// Set several zones, batching up to five per transfer
    pub fn set_many_zones(&mut self, zones: &[Zone], colors: &[Rgb]) -> Result<()> {
        let cmds = ColorCommand::pair(zones, colors)?;
        self.apply(&cmds)
    }

    /// Set several zones by raw wire id; all ids are validated first
    pub fn set_many_zones_raw(&mut self, zone_ids: &[u8], colors: &[Rgb]) -> Result<()> {
        let cmds = ColorCommand::pair_raw(zone_ids, colors)?;
        self.apply(&cmds)
    }

    /// Send the packets for `cmds`, stopping at the first failed transfer
    pub fn apply(&mut self, cmds: &[ColorCommand]) -> Result<()> {
        self.ensure_initialized()?;
        for packet in plan_packets(cmds, &mut self.headers) {
            self.send_and_pace(&packet)?;
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized && self.device.is_some() {
            Ok(())
        } else {
            Err(DriverError::NotInitialized)
        }
    }

    fn send_and_pace(&mut self, packet: &Packet) -> Result<()> {
        let result = self.send_packet(packet);

        let pause = if packet.light_count() > 1 {
            self.settings.batch_packet_delay()
        } else {
            self.settings.single_packet_delay()
        };
        if !pause.is_zero() {
            thread::sleep(pause);
        }

        result
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let location = self.identity.location();
        let claim_retry = self.settings.claim_retry();
        let transfer_retry = self.settings.transfer_retry();
        let per_operation = self.settings.claim_policy == ClaimPolicy::PerOperation;

        let device = self.device.as_mut().ok_or(DriverError::NotInitialized)?;
        device.claim(claim_retry, &location)?;

        let result = device.transport.send_with_retry(packet, transfer_retry);

        if per_operation {
            if let Err(e) = device.release() {
                warn!("Failed to release interface {} on {}: {}", INTERFACE, location, e);
            }
        }

        result.map_err(DriverError::from)
    }

    /// Turn lights off and release everything; safe to call repeatedly
    pub fn close(&mut self) {
        let location = self.identity.location();

        if self.initialized {
            if self.settings.blank_on_close {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.set_all_zones(Rgb::OFF)));
                match outcome {
                    Ok(Ok(())) => debug!("Turned off lights on {}", location),
                    Ok(Err(e)) => warn!("Failed to turn off lights on {}: {}", location, e),
                    Err(_) => warn!("Panic while turning off lights on {}", location),
                }
            }
            self.initialized = false;
        }

        if let Some(mut device) = self.device.take() {
            if device.claimed {
                match device.release() {
                    Ok(()) => debug!("Released interface {} on {}", INTERFACE, location),
                    Err(e) => warn!("Failed to release interface {} on {}: {}", INTERFACE, location, e),
                }
            }

            if device.kernel_driver_detached {
                match device.transport.handle_mut().attach_kernel_driver(INTERFACE) {
                    Ok(()) => debug!("Reattached kernel driver to interface {}", INTERFACE),
                    Err(e) => debug!(
                        "Could not reattach kernel driver to interface {}: {}",
                        INTERFACE, e
                    ),
                }
            }

            drop(device);
            debug!("Closed {}", location);
        }

        if let Some(bus) = self.bus.take() {
            drop(bus);
            debug!("Released USB context for {}", location);
        }
    }
}

impl<B: UsbBackend> Drop for DeviceSession<B> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambx_common::test_utils::{MockDevice, MockUsb, UsbCall, WriteOutcome};

    fn quiet_settings() -> SessionSettings {
        SessionSettings {
            blank_on_open: false,
            single_packet_delay_ms: 0,
            batch_packet_delay_ms: 0,
            transfer_backoff_ms: 1,
            ..SessionSettings::default()
        }
    }

    fn open(usb: &MockUsb, settings: SessionSettings) -> Result<DeviceSession<MockUsb>> {
        DeviceSession::open(usb, DeviceIdentity::ambx(1, 4), settings)
    }

    #[test]
    fn test_identity_strings() {
        let identity = DeviceIdentity::ambx(3, 7);
        assert_eq!(identity.path(), "3-7");
        assert_eq!(identity.location(), "USB amBX: Bus 3 Addr 7");
        assert_eq!(identity.to_string(), "0471:083f at 3-7");
        assert!(DeviceIdentity::is_ambx(0x0471, 0x083F));
        assert!(!DeviceIdentity::is_ambx(0x0471, 0x0840));
    }

    #[test]
    fn test_open_sequence_hold_policy() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4).with_serial("AX0001"));
        let session = open(&usb, quiet_settings()).unwrap();

        assert!(session.is_initialized());
        assert!(session.is_interface_claimed());
        assert_eq!(session.serial(), "AX0001");
        assert_eq!(
            usb.calls(),
            vec![
                UsbCall::Init,
                UsbCall::Enumerate,
                UsbCall::Open { bus: 1, address: 4 },
                UsbCall::KernelDriverActive(0),
                UsbCall::Claim(0),
                UsbCall::ReadSerial,
            ]
        );
    }

    #[test]
    fn test_missing_serial_is_empty() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4));
        let session = open(&usb, quiet_settings()).unwrap();
        assert_eq!(session.serial(), "");
    }

    #[test]
    fn test_opens_device_at_requested_address() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 2))
            .with_device(MockDevice::ambx(1, 4));
        let _session = open(&usb, quiet_settings()).unwrap();

        assert!(usb.calls().contains(&UsbCall::Open { bus: 1, address: 4 }));
        assert!(!usb.calls().contains(&UsbCall::Open { bus: 1, address: 2 }));
    }

    #[test]
    fn test_device_not_found_releases_context() {
        let usb = MockUsb::new().with_device(MockDevice::other(0x046d, 0xc52b, 1, 4));
        let err = open(&usb, quiet_settings()).err().unwrap();

        assert!(matches!(err, DriverError::DeviceNotFound { .. }));
        assert_eq!(usb.live_contexts(), 0);
    }

    #[test]
    fn test_transport_init_failure() {
        let usb = MockUsb::new().failing_init(rusb::Error::NoMem);
        let err = open(&usb, quiet_settings()).err().unwrap();

        assert!(matches!(err, DriverError::TransportInit(rusb::Error::NoMem)));
        assert!(err.is_fatal_for_pass());
    }

    #[test]
    fn test_enumeration_failure_releases_context() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4))
            .failing_enumerate(rusb::Error::Io);
        let err = open(&usb, quiet_settings()).err().unwrap();

        assert!(matches!(err, DriverError::Enumeration(rusb::Error::Io)));
        assert_eq!(usb.live_contexts(), 0);
    }

    #[test]
    fn test_open_failure_releases_context() {
        let usb =
            MockUsb::new().with_device(MockDevice::ambx(1, 4).failing_open(rusb::Error::Access));
        let err = open(&usb, quiet_settings()).err().unwrap();

        assert!(matches!(
            err,
            DriverError::Open {
                source: rusb::Error::Access,
                ..
            }
        ));
        assert!(err.remediation().is_some());
        assert_eq!(usb.open_handles(), 0);
        assert_eq!(usb.live_contexts(), 0);
    }

    #[test]
    fn test_claim_always_busy_makes_three_attempts() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4))
            .claim_always(rusb::Error::Busy);
        let err = open(&usb, quiet_settings()).err().unwrap();

        assert!(matches!(
            err,
            DriverError::Claim {
                attempts: 3,
                source: rusb::Error::Busy,
                ..
            }
        ));
        assert_eq!(usb.claim_attempts(), 3);

        let gaps = usb.claim_gaps();
        assert_eq!(gaps.len(), 2);
        for gap in gaps {
            assert!(gap >= Duration::from_millis(20), "gap was {:?}", gap);
        }

        // Nothing left open, and no release for a claim that never happened
        assert_eq!(usb.open_handles(), 0);
        assert_eq!(usb.live_contexts(), 0);
        assert!(!usb.calls().contains(&UsbCall::Release(0)));
        assert!(usb.writes().is_empty());
    }

    #[test]
    fn test_zero_claim_delay_still_spaces_attempts() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4))
            .claim_always(rusb::Error::Busy);
        let settings = SessionSettings {
            claim_retry_delay_ms: 0,
            ..quiet_settings()
        };
        assert!(open(&usb, settings).is_err());

        let gaps = usb.claim_gaps();
        assert_eq!(gaps.len(), 2);
        for gap in gaps {
            assert!(gap >= Duration::from_millis(1), "gap was {:?}", gap);
        }
    }

    #[test]
    fn test_claim_succeeds_after_busy() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4))
            .claim_script([Err(rusb::Error::Busy), Err(rusb::Error::Busy), Ok(())]);
        let session = open(&usb, quiet_settings()).unwrap();

        assert!(session.is_interface_claimed());
        assert_eq!(usb.claim_attempts(), 3);
    }

    #[test]
    fn test_claim_stops_when_device_gone() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4))
            .claim_always(rusb::Error::NoDevice);
        let err = open(&usb, quiet_settings()).err().unwrap();

        assert!(matches!(
            err,
            DriverError::Claim {
                source: rusb::Error::NoDevice,
                ..
            }
        ));
        assert_eq!(usb.claim_attempts(), 1);
    }

    #[test]
    fn test_kernel_driver_detached_and_reattached() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4).with_kernel_driver());
        let session = open(&usb, quiet_settings()).unwrap();
        assert!(usb.calls().contains(&UsbCall::DetachKernelDriver(0)));

        drop(session);
        let calls = usb.calls();
        let release = calls.iter().position(|c| *c == UsbCall::Release(0)).unwrap();
        let attach = calls
            .iter()
            .position(|c| *c == UsbCall::AttachKernelDriver(0))
            .unwrap();
        assert!(release < attach);
    }

    #[test]
    fn test_detach_failure_is_not_fatal() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4).with_kernel_driver())
            .failing_detach(rusb::Error::NotSupported);
        let session = open(&usb, quiet_settings()).unwrap();
        assert!(session.is_initialized());

        drop(session);
        assert!(!usb.calls().contains(&UsbCall::AttachKernelDriver(0)));
    }

    #[test]
    fn test_blank_on_open_sends_one_batch() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4));
        let settings = SessionSettings {
            blank_on_open: true,
            ..quiet_settings()
        };
        let _session = open(&usb, settings).unwrap();

        let writes = usb.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 26);
        assert_eq!(writes[0][0], 0xA4);
    }

    #[test]
    fn test_set_zone_color_single_packet() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4));
        let mut session = open(&usb, quiet_settings()).unwrap();

        session
            .set_zone_color(Zone::WallRight, Rgb::new(10, 20, 30))
            .unwrap();
        assert_eq!(usb.writes(), vec![vec![0xA1, 0x4B, 0x03, 10, 20, 30]]);
    }

    #[test]
    fn test_invalid_raw_zone_never_reaches_transport() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4));
        let mut session = open(&usb, quiet_settings()).unwrap();

        let err = session.set_zone_color_raw(0x5B, Rgb::new(1, 1, 1)).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));

        let err = session
            .set_many_zones_raw(&[0x0B, 0x1B, 0x77], &[Rgb::OFF; 3])
            .unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));

        assert!(usb.writes().is_empty());
    }

    #[test]
    fn test_set_many_zones_chunks_into_batches() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4));
        let mut session = open(&usb, quiet_settings()).unwrap();

        let zones: Vec<Zone> = Zone::LIGHTS.iter().chain(&Zone::LIGHTS[..2]).copied().collect();
        let colors = vec![Rgb::new(1, 2, 3); zones.len()];
        session.set_many_zones(&zones, &colors).unwrap();

        let writes = usb.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].len(), 26);
        assert_eq!(writes[1].len(), 11);
        assert_ne!(writes[0][0], writes[1][0], "batch headers rotate");
    }

    #[test]
    fn test_transfer_failure_is_reported_not_fatal() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4))
            .write_always(WriteOutcome::Fail(rusb::Error::Timeout));
        let mut session = open(&usb, quiet_settings()).unwrap();

        let err = session.set_all_zones(Rgb::new(255, 0, 0)).unwrap_err();
        assert!(matches!(err, DriverError::Transfer(_)));
        assert_eq!(usb.writes().len(), 3);
        assert!(session.is_initialized());
    }

    #[test]
    fn test_partial_transfer_surfaces_as_error() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4))
            .write_always(WriteOutcome::Short(2));
        let mut session = open(&usb, quiet_settings()).unwrap();

        let err = session.set_zone_color(Zone::All, Rgb::OFF).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Transfer(crate::error::TransferError::Partial { sent: 2, expected: 6 })
        ));
    }

    #[test]
    fn test_per_operation_policy_claims_around_each_packet() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4));
        let settings = SessionSettings {
            claim_policy: ClaimPolicy::PerOperation,
            ..quiet_settings()
        };
        let mut session = open(&usb, settings).unwrap();
        assert!(!session.is_interface_claimed());

        usb.clear_calls();
        session.set_zone_color(Zone::LeftSatellite, Rgb::OFF).unwrap();

        assert_eq!(
            usb.calls(),
            vec![
                UsbCall::Claim(0),
                UsbCall::Write {
                    endpoint: 0x02,
                    data: vec![0xA1, 0x0B, 0x03, 0, 0, 0],
                },
                UsbCall::Release(0),
            ]
        );
        assert!(!session.is_interface_claimed());
    }

    #[test]
    fn test_per_operation_claim_failure_skips_transfer() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4))
            .claim_script([Ok(())])
            .claim_always(rusb::Error::Busy);
        let settings = SessionSettings {
            claim_policy: ClaimPolicy::PerOperation,
            claim_retry_delay_ms: 1,
            ..quiet_settings()
        };
        let mut session = open(&usb, settings).unwrap();

        let err = session.set_zone_color(Zone::LeftSatellite, Rgb::OFF).unwrap_err();
        assert!(matches!(err, DriverError::Claim { .. }));
        assert!(usb.writes().is_empty());
    }

    #[test]
    fn test_teardown_order() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4));
        let session = open(&usb, quiet_settings()).unwrap();
        usb.clear_calls();

        drop(session);

        let calls = usb.calls();
        assert!(matches!(calls[0], UsbCall::Write { .. }), "lights off first");
        assert_eq!(
            &calls[1..],
            &[
                UsbCall::Release(0),
                UsbCall::Close { bus: 1, address: 4 },
                UsbCall::Exit,
            ]
        );
    }

    #[test]
    fn test_teardown_continues_after_failures() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4))
            .write_always(WriteOutcome::Fail(rusb::Error::Pipe))
            .failing_release(rusb::Error::NoDevice);
        let session = open(&usb, quiet_settings()).unwrap();
        usb.clear_calls();

        drop(session);

        let calls = usb.calls();
        let tail = &calls[calls.len() - 3..];
        assert_eq!(
            tail,
            &[
                UsbCall::Release(0),
                UsbCall::Close { bus: 1, address: 4 },
                UsbCall::Exit,
            ]
        );
        assert_eq!(usb.writes().len(), 3, "lights-off retried then dropped");
        assert_eq!(usb.open_handles(), 0);
        assert_eq!(usb.live_contexts(), 0);
    }

    #[test]
    fn test_teardown_survives_panicking_lights_off() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 4))
            .write_always(WriteOutcome::Panic);
        let session = open(&usb, quiet_settings()).unwrap();
        usb.clear_calls();

        drop(session);

        assert_eq!(
            &usb.calls()[1..],
            &[
                UsbCall::Release(0),
                UsbCall::Close { bus: 1, address: 4 },
                UsbCall::Exit,
            ]
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4));
        let mut session = open(&usb, quiet_settings()).unwrap();

        session.close();
        assert!(!session.is_initialized());
        usb.clear_calls();

        session.close();
        assert!(usb.calls().is_empty());
        assert!(matches!(
            session.set_all_zones(Rgb::OFF),
            Err(DriverError::NotInitialized)
        ));
        drop(session);
        assert!(usb.calls().is_empty());
    }

    #[test]
    fn test_keep_colors_on_close() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4));
        let mut session = open(&usb, quiet_settings()).unwrap();
        session.set_blank_on_close(false);
        usb.clear_calls();

        drop(session);
        assert!(usb.writes().is_empty());
    }
}
