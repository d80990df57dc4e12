//! Interrupt OUT transport
//!
//! Owns the device handle and performs blocking writes to the amBX output
//! endpoint. A write only counts as sent when every byte went out.
//!
//! The device also exposes an interrupt IN endpoint (`0x81`) and a
//! plug-and-play endpoint (`0x83`); neither is read by this driver.

use crate::error::TransferError;
use ambx_common::UsbDeviceHandle;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Control interface of the amBX
pub const INTERFACE: u8 = 0;

/// Interrupt OUT endpoint carrying color packets
pub const ENDPOINT_OUT: u8 = 0x02;

/// Default per-attempt timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Retry policy for packet transfers
///
/// Backoff is linear: the wait after attempt `n` (0-based) is
/// `backoff_step * (n + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_step: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Delay between attempt `attempt` and the next one
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_step * (attempt + 1)
    }
}

/// Blocking writer for one opened device
#[derive(Debug)]
pub struct Transport<H> {
    handle: H,
    endpoint: u8,
    timeout: Duration,
}

impl<H: UsbDeviceHandle> Transport<H> {
    pub fn new(handle: H) -> Self {
        Self {
            handle,
            endpoint: ENDPOINT_OUT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    /// Send `data` once
    pub fn send(&self, data: &[u8]) -> Result<(), TransferError> {
        match self.handle.write_interrupt(self.endpoint, data, self.timeout) {
            Ok(sent) if sent == data.len() => Ok(()),
            Ok(sent) => Err(TransferError::Partial {
                sent,
                expected: data.len(),
            }),
            Err(e) => Err(TransferError::Usb(e)),
        }
    }

    /// Send `data`, retrying with backoff on any failure
    ///
    /// Returns the error of the final attempt.
    pub fn send_with_retry(&self, data: &[u8], policy: RetryPolicy) -> Result<(), TransferError> {
        let attempts = policy.attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.send(data) {
                Ok(()) => {
                    if attempt > 0 {
                        debug!(
                            "Interrupt transfer succeeded on attempt {}/{}",
                            attempt + 1,
                            attempts
                        );
                    }
                    return Ok(());
                }
                Err(e @ TransferError::Partial { .. }) => {
                    // A truncated packet reached the device even if a retry succeeds
                    error!(
                        "{} - the light may be left in an undefined state (attempt {}/{})",
                        e,
                        attempt + 1,
                        attempts
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    debug!(
                        "Interrupt transfer attempt {}/{} failed: {}",
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }

            if attempt + 1 < attempts {
                thread::sleep(policy.delay_after(attempt));
            }
        }

        let err = last_error.unwrap_or(TransferError::Usb(rusb::Error::Other));
        match &err {
            TransferError::Partial { .. } => {
                error!("Giving up after {} attempt(s): {}", attempts, err);
            }
            TransferError::Usb(rusb::Error::NoDevice) => {
                warn!("{} (device unplugged?)", err);
            }
            TransferError::Usb(_) => error!("{}", err),
        }
        Err(err)
    }
}
