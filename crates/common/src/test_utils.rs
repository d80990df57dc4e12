//! Test utilities for the amBX driver
//!
//! Provides an in-memory USB backend that records every call made through
//! the [`crate::usb_types`] traits and can be scripted to fail. Enabled with
//! the `test-utils` feature.

use crate::usb_types::{UsbBackend, UsbBus, UsbDeviceHandle, UsbDeviceRef};
use ambx_protocol::{AMBX_PID, AMBX_VID};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One observed backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbCall {
    /// Context created
    Init,
    /// Device list requested
    Enumerate,
    Open { bus: u8, address: u8 },
    KernelDriverActive(u8),
    DetachKernelDriver(u8),
    AttachKernelDriver(u8),
    Claim(u8),
    Release(u8),
    Write { endpoint: u8, data: Vec<u8> },
    ReadSerial,
    /// Handle dropped
    Close { bus: u8, address: u8 },
    /// Context dropped
    Exit,
}

/// Result of a scripted interrupt write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteOutcome {
    /// Every byte transferred
    #[default]
    Complete,
    /// Success reported, but only this many bytes went out
    Short(usize),
    /// Transfer error
    Fail(rusb::Error),
    /// The write panics
    Panic,
}

/// A fake device on the mock bus
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    pub serial: Option<String>,
    pub open_error: Option<rusb::Error>,
    pub descriptor_error: Option<rusb::Error>,
    pub kernel_driver_active: bool,
}

impl MockDevice {
    /// An amBX at the given bus and address
    pub fn ambx(bus: u8, address: u8) -> Self {
        Self::other(AMBX_VID, AMBX_PID, bus, address)
    }

    /// Any other device
    pub fn other(vendor_id: u16, product_id: u16, bus: u8, address: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            bus,
            address,
            serial: None,
            open_error: None,
            descriptor_error: None,
            kernel_driver_active: false,
        }
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    pub fn failing_open(mut self, error: rusb::Error) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn failing_descriptor(mut self, error: rusb::Error) -> Self {
        self.descriptor_error = Some(error);
        self
    }

    /// A kernel driver is bound to the interfaces
    pub fn with_kernel_driver(mut self) -> Self {
        self.kernel_driver_active = true;
        self
    }
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<MockDevice>,
    calls: Vec<UsbCall>,
    claim_times: Vec<Instant>,
    init_error: Option<rusb::Error>,
    enumerate_error: Option<rusb::Error>,
    claim_script: VecDeque<rusb::Result<()>>,
    claim_error: Option<rusb::Error>,
    write_script: VecDeque<WriteOutcome>,
    write_default: WriteOutcome,
    release_error: Option<rusb::Error>,
    detach_error: Option<rusb::Error>,
    open_handles: usize,
    live_contexts: usize,
}

/// Scriptable in-memory USB backend
///
/// Clones share state, so a test can keep one clone for assertions and hand
/// another to the code under test.
#[derive(Debug, Clone, Default)]
pub struct MockUsb {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    // A panic injected by WriteOutcome::Panic must not break later assertions
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockUsb {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    pub fn with_device(self, device: MockDevice) -> Self {
        self.state().devices.push(device);
        self
    }

    /// Context creation fails
    pub fn failing_init(self, error: rusb::Error) -> Self {
        self.state().init_error = Some(error);
        self
    }

    /// Device enumeration fails
    pub fn failing_enumerate(self, error: rusb::Error) -> Self {
        self.state().enumerate_error = Some(error);
        self
    }

    /// Every claim returns `error` once the script is exhausted
    pub fn claim_always(self, error: rusb::Error) -> Self {
        self.state().claim_error = Some(error);
        self
    }

    /// Queue claim results; consumed before the default applies
    pub fn claim_script(self, results: impl IntoIterator<Item = rusb::Result<()>>) -> Self {
        self.state().claim_script.extend(results);
        self
    }

    /// Default outcome for writes once the script is exhausted
    pub fn write_always(self, outcome: WriteOutcome) -> Self {
        self.state().write_default = outcome;
        self
    }

    /// Queue write outcomes; consumed before the default applies
    pub fn write_script(self, outcomes: impl IntoIterator<Item = WriteOutcome>) -> Self {
        self.state().write_script.extend(outcomes);
        self
    }

    pub fn failing_release(self, error: rusb::Error) -> Self {
        self.state().release_error = Some(error);
        self
    }

    pub fn failing_detach(self, error: rusb::Error) -> Self {
        self.state().detach_error = Some(error);
        self
    }

    /// Every call recorded so far, in order
    pub fn calls(&self) -> Vec<UsbCall> {
        self.state().calls.clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        let mut state = self.state();
        state.calls.clear();
        state.claim_times.clear();
    }

    /// Payloads of all interrupt writes, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                UsbCall::Write { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of claim attempts
    pub fn claim_attempts(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, UsbCall::Claim(_)))
            .count()
    }

    /// Gaps between consecutive claim attempts
    pub fn claim_gaps(&self) -> Vec<Duration> {
        self.state()
            .claim_times
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }

    /// Handles opened and not yet closed
    pub fn open_handles(&self) -> usize {
        self.state().open_handles
    }

    /// Contexts created and not yet torn down
    pub fn live_contexts(&self) -> usize {
        self.state().live_contexts
    }
}

impl UsbBackend for MockUsb {
    type Bus = MockBus;

    fn init(&self) -> rusb::Result<MockBus> {
        let mut state = self.state();
        state.calls.push(UsbCall::Init);
        if let Some(error) = state.init_error {
            return Err(error);
        }
        state.live_contexts += 1;

        Ok(MockBus {
            state: Arc::clone(&self.state),
        })
    }
}

/// Context handed out by [`MockUsb`]
#[derive(Debug)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl UsbBus for MockBus {
    type Device = MockDeviceRef;

    fn devices(&self) -> rusb::Result<Vec<MockDeviceRef>> {
        let mut state = lock(&self.state);
        state.calls.push(UsbCall::Enumerate);
        if let Some(error) = state.enumerate_error {
            return Err(error);
        }

        Ok(state
            .devices
            .iter()
            .cloned()
            .map(|spec| MockDeviceRef {
                spec,
                state: Arc::clone(&self.state),
            })
            .collect())
    }
}

impl Drop for MockBus {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.calls.push(UsbCall::Exit);
        state.live_contexts = state.live_contexts.saturating_sub(1);
    }
}

/// Enumerated device on a [`MockBus`]
#[derive(Debug)]
pub struct MockDeviceRef {
    spec: MockDevice,
    state: Arc<Mutex<MockState>>,
}

impl UsbDeviceRef for MockDeviceRef {
    type Handle = MockHandle;

    fn vendor_product(&self) -> rusb::Result<(u16, u16)> {
        match self.spec.descriptor_error {
            Some(error) => Err(error),
            None => Ok((self.spec.vendor_id, self.spec.product_id)),
        }
    }

    fn bus_number(&self) -> u8 {
        self.spec.bus
    }

    fn address(&self) -> u8 {
        self.spec.address
    }

    fn open(&self) -> rusb::Result<MockHandle> {
        let mut state = lock(&self.state);
        state.calls.push(UsbCall::Open {
            bus: self.spec.bus,
            address: self.spec.address,
        });
        if let Some(error) = self.spec.open_error {
            return Err(error);
        }
        state.open_handles += 1;

        Ok(MockHandle {
            spec: self.spec.clone(),
            kernel_driver_active: self.spec.kernel_driver_active,
            state: Arc::clone(&self.state),
        })
    }
}

/// Open handle on a [`MockDeviceRef`]
#[derive(Debug)]
pub struct MockHandle {
    spec: MockDevice,
    kernel_driver_active: bool,
    state: Arc<Mutex<MockState>>,
}

impl UsbDeviceHandle for MockHandle {
    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool> {
        lock(&self.state)
            .calls
            .push(UsbCall::KernelDriverActive(interface));
        Ok(self.kernel_driver_active)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(UsbCall::DetachKernelDriver(interface));
        if let Some(error) = state.detach_error {
            return Err(error);
        }
        self.kernel_driver_active = false;
        Ok(())
    }

    fn attach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        lock(&self.state)
            .calls
            .push(UsbCall::AttachKernelDriver(interface));
        self.kernel_driver_active = true;
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(UsbCall::Claim(interface));
        state.claim_times.push(Instant::now());

        match state.claim_script.pop_front() {
            Some(result) => result,
            None => state.claim_error.map_or(Ok(()), Err),
        }
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(UsbCall::Release(interface));
        state.release_error.map_or(Ok(()), Err)
    }

    fn write_interrupt(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        let outcome = {
            let mut state = lock(&self.state);
            state.calls.push(UsbCall::Write {
                endpoint,
                data: data.to_vec(),
            });
            let default = state.write_default;
            state.write_script.pop_front().unwrap_or(default)
        };

        match outcome {
            WriteOutcome::Complete => Ok(data.len()),
            WriteOutcome::Short(sent) => Ok(sent.min(data.len())),
            WriteOutcome::Fail(error) => Err(error),
            WriteOutcome::Panic => panic!("mock interrupt write panicked"),
        }
    }

    fn serial_number(&self) -> Option<String> {
        lock(&self.state).calls.push(UsbCall::ReadSerial);
        self.spec.serial.clone()
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.calls.push(UsbCall::Close {
            bus: self.spec.bus,
            address: self.spec.address,
        });
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_lifecycle_is_recorded() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(1, 4));
        let bus = usb.init().unwrap();
        let devices = bus.devices().unwrap();
        assert_eq!(devices[0].address(), 4);

        drop(devices);
        drop(bus);
        assert_eq!(usb.calls(), vec![UsbCall::Init, UsbCall::Enumerate, UsbCall::Exit]);
    }

    #[test]
    fn test_open_and_close_are_tracked() {
        let usb = MockUsb::new().with_device(MockDevice::ambx(2, 7).with_serial("AMBX-1"));
        let bus = usb.init().unwrap();
        let devices = bus.devices().unwrap();
        let handle = devices[0].open().unwrap();

        assert_eq!(usb.open_handles(), 1);
        assert_eq!(handle.serial_number().as_deref(), Some("AMBX-1"));

        drop(handle);
        assert_eq!(usb.open_handles(), 0);
        drop(devices);
        drop(bus);
        assert_eq!(usb.live_contexts(), 0);
    }

    #[test]
    fn test_claim_script_before_default() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 1))
            .claim_script([Err(rusb::Error::Busy)])
            .claim_always(rusb::Error::Access);
        let bus = usb.init().unwrap();
        let mut handle = bus.devices().unwrap()[0].open().unwrap();

        assert_eq!(handle.claim_interface(0), Err(rusb::Error::Busy));
        assert_eq!(handle.claim_interface(0), Err(rusb::Error::Access));
        assert_eq!(usb.claim_attempts(), 2);
    }

    #[test]
    fn test_short_write_reports_partial_length() {
        let usb = MockUsb::new()
            .with_device(MockDevice::ambx(1, 1))
            .write_script([WriteOutcome::Short(3)]);
        let bus = usb.init().unwrap();
        let handle = bus.devices().unwrap()[0].open().unwrap();

        let sent = handle
            .write_interrupt(0x02, &[1, 2, 3, 4, 5, 6], Duration::from_millis(100))
            .unwrap();
        assert_eq!(sent, 3);
        assert_eq!(usb.writes(), vec![vec![1, 2, 3, 4, 5, 6]]);
    }
}
