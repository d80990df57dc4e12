//! USB backend abstraction
//!
//! The driver talks to libusb through these four traits so that sessions,
//! transports and discovery can run against an in-memory backend in tests.
//! The rusb implementations are thin forwards to the inherent methods.
//!
//! Ownership mirrors libusb: a [`UsbBackend`] creates a bus context, the bus
//! lists devices, and an opened device yields a handle. Dropping a handle
//! closes it; dropping the bus context tears libusb down.

use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;

/// Factory for USB contexts
pub trait UsbBackend {
    type Bus: UsbBus;

    /// Create a fresh context (`libusb_init`)
    fn init(&self) -> rusb::Result<Self::Bus>;
}

/// An initialized USB context
pub trait UsbBus {
    type Device: UsbDeviceRef;

    /// Snapshot of the devices currently on the bus
    fn devices(&self) -> rusb::Result<Vec<Self::Device>>;
}

/// A device seen during enumeration, not yet opened
pub trait UsbDeviceRef {
    type Handle: UsbDeviceHandle;

    /// Vendor and product id from the device descriptor
    fn vendor_product(&self) -> rusb::Result<(u16, u16)>;

    fn bus_number(&self) -> u8;

    fn address(&self) -> u8;

    fn open(&self) -> rusb::Result<Self::Handle>;
}

/// An opened device; dropping it closes the handle
pub trait UsbDeviceHandle {
    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool>;

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()>;

    fn attach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()>;

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;

    /// Blocking interrupt OUT transfer, returns bytes actually transferred
    fn write_interrupt(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Serial number string descriptor, if the device has one
    fn serial_number(&self) -> Option<String>;
}

/// libusb backend via rusb
#[derive(Debug, Clone, Copy, Default)]
pub struct RusbBackend;

impl UsbBackend for RusbBackend {
    type Bus = Context;

    fn init(&self) -> rusb::Result<Context> {
        Context::new()
    }
}

impl UsbBus for Context {
    type Device = Device<Context>;

    fn devices(&self) -> rusb::Result<Vec<Device<Context>>> {
        Ok(UsbContext::devices(self)?.iter().collect())
    }
}

impl UsbDeviceRef for Device<Context> {
    type Handle = DeviceHandle<Context>;

    fn vendor_product(&self) -> rusb::Result<(u16, u16)> {
        let descriptor = self.device_descriptor()?;
        Ok((descriptor.vendor_id(), descriptor.product_id()))
    }

    fn bus_number(&self) -> u8 {
        Device::bus_number(self)
    }

    fn address(&self) -> u8 {
        Device::address(self)
    }

    fn open(&self) -> rusb::Result<DeviceHandle<Context>> {
        Device::open(self)
    }
}

impl UsbDeviceHandle for DeviceHandle<Context> {
    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool> {
        DeviceHandle::kernel_driver_active(self, interface)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::detach_kernel_driver(self, interface)
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::attach_kernel_driver(self, interface)
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, interface)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, interface)
    }

    fn write_interrupt(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_interrupt(self, endpoint, data, timeout)
    }

    fn serial_number(&self) -> Option<String> {
        let descriptor = self.device().device_descriptor().ok()?;
        let index = descriptor.serial_number_string_index()?;

        self.read_string_descriptor_ascii(index)
            .ok()
            .map(|serial| serial.trim().to_string())
            .filter(|serial| !serial.is_empty())
    }
}
