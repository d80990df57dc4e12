//! Host-facing amBX controller
//!
//! [`AmbxController`] wraps one initialized [`DeviceSession`] with the
//! amBX light layout and a per-LED color buffer. Hosts edit the buffer and
//! push it with one of the `update_*` calls. [`ControllerRegistry`] owns
//! every controller that discovery registered.

use crate::error::{DriverError, Result};
use crate::usb::session::{DeviceIdentity, DeviceSession};
use ambx_common::UsbBackend;
use ambx_protocol::{ColorCommand, MAX_BATCH_LIGHTS, Rgb, Zone};
use serde::Serialize;
use std::ops::Range;
use tracing::{debug, info};

pub const VENDOR: &str = "Philips";
pub const DESCRIPTION: &str = "Philips amBX Gaming Device";
pub const BASE_NAME: &str = "Philips amBX";

/// One addressable light
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Led {
    pub name: &'static str,
    pub zone: Zone,
}

/// A named, contiguous group of LEDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneLayout {
    pub name: &'static str,
    pub leds: Range<usize>,
}

/// LEDs in buffer order
pub const LEDS: [Led; 5] = [
    Led {
        name: "Left",
        zone: Zone::LeftSatellite,
    },
    Led {
        name: "Right",
        zone: Zone::RightSatellite,
    },
    Led {
        name: "Wall Left",
        zone: Zone::WallLeft,
    },
    Led {
        name: "Wall Center",
        zone: Zone::WallCenter,
    },
    Led {
        name: "Wall Right",
        zone: Zone::WallRight,
    },
];

/// Side lights then the wallwasher bar
pub const ZONES: [ZoneLayout; 2] = [
    ZoneLayout {
        name: "Side Lights",
        leds: 0..2,
    },
    ZoneLayout {
        name: "Wallwasher",
        leds: 2..5,
    },
];

/// Serializable controller summary
#[derive(Debug, Clone, Serialize)]
pub struct ControllerInfo {
    pub name: String,
    pub vendor: &'static str,
    pub description: &'static str,
    pub location: String,
    pub serial: String,
    pub identity: DeviceIdentity,
    pub initialized: bool,
    pub zones: Vec<ZoneInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneInfo {
    pub name: &'static str,
    pub leds: Vec<LedInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedInfo {
    pub name: &'static str,
    pub zone_id: u8,
    pub color: Rgb,
}

pub struct AmbxController<B: UsbBackend> {
    name: String,
    session: DeviceSession<B>,
    colors: [Rgb; 5],
}

impl<B: UsbBackend> AmbxController<B> {
    pub fn new(name: impl Into<String>, session: DeviceSession<B>) -> Self {
        Self {
            name: name.into(),
            session,
            colors: [Rgb::OFF; 5],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> &'static str {
        VENDOR
    }

    pub fn description(&self) -> &'static str {
        DESCRIPTION
    }

    pub fn location(&self) -> String {
        self.session.location()
    }

    pub fn serial(&self) -> &str {
        self.session.serial()
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.session.identity()
    }

    pub fn leds(&self) -> &'static [Led] {
        &LEDS
    }

    pub fn zones(&self) -> &'static [ZoneLayout] {
        &ZONES
    }

    /// Current color buffer, in [`LEDS`] order
    pub fn colors(&self) -> &[Rgb] {
        &self.colors
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_initialized()
    }

    pub fn session_mut(&mut self) -> &mut DeviceSession<B> {
        &mut self.session
    }

    /// Set one zone on the device and mirror it in the buffer
    pub fn set_zone_color(&mut self, zone: Zone, color: Rgb) -> Result<()> {
        self.session.set_zone_color(zone, color)?;
        self.remember(zone, color);
        Ok(())
    }

    pub fn set_all_zones(&mut self, color: Rgb) -> Result<()> {
        self.session.set_all_zones(color)?;
        self.colors = [color; 5];
        Ok(())
    }

    /// Set several zones; the buffer keeps every chunk that was delivered
    pub fn set_many_zones(&mut self, zones: &[Zone], colors: &[Rgb]) -> Result<()> {
        let cmds = ColorCommand::pair(zones, colors)?;
        for chunk in cmds.chunks(MAX_BATCH_LIGHTS) {
            self.session.apply(chunk)?;
            for cmd in chunk {
                self.remember(cmd.zone, cmd.color);
            }
        }
        Ok(())
    }

    /// Change one buffered LED; nothing is sent until an update
    pub fn set_led_color(&mut self, index: usize, color: Rgb) -> Result<()> {
        let slot = self
            .colors
            .get_mut(index)
            .ok_or(DriverError::LedIndex(index))?;
        *slot = color;
        Ok(())
    }

    /// Send the whole buffer as one batch
    pub fn update_leds(&mut self) -> Result<()> {
        self.send_range(0..LEDS.len())
    }

    /// Send the buffered colors of zone `index`
    pub fn update_zone(&mut self, index: usize) -> Result<()> {
        let leds = ZONES
            .get(index)
            .map(|zone| zone.leds.clone())
            .ok_or(DriverError::ZoneIndex(index))?;
        self.send_range(leds)
    }

    /// Send the buffered color of LED `index`
    pub fn update_single_led(&mut self, index: usize) -> Result<()> {
        if index >= LEDS.len() {
            return Err(DriverError::LedIndex(index));
        }
        self.send_range(index..index + 1)
    }

    fn send_range(&mut self, leds: Range<usize>) -> Result<()> {
        if !self.session.is_initialized() {
            debug!("Skipping update on closed {}", self.name);
            return Ok(());
        }

        let cmds: Vec<ColorCommand> = leds
            .map(|i| ColorCommand::new(LEDS[i].zone, self.colors[i]))
            .collect();
        self.session.apply(&cmds)
    }

    fn remember(&mut self, zone: Zone, color: Rgb) {
        for (led, slot) in LEDS.iter().zip(self.colors.iter_mut()) {
            if zone == Zone::All || led.zone == zone {
                *slot = color;
            }
        }
    }

    pub fn info(&self) -> ControllerInfo {
        ControllerInfo {
            name: self.name.clone(),
            vendor: self.vendor(),
            description: self.description(),
            location: self.location(),
            serial: self.serial().to_string(),
            identity: self.identity(),
            initialized: self.is_initialized(),
            zones: self
                .zones()
                .iter()
                .map(|zone| ZoneInfo {
                    name: zone.name,
                    leds: zone
                        .leds
                        .clone()
                        .map(|i| LedInfo {
                            name: self.leds()[i].name,
                            zone_id: self.leds()[i].zone.id(),
                            color: self.colors[i],
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Registered controllers, named in registration order
pub struct ControllerRegistry<B: UsbBackend> {
    controllers: Vec<AmbxController<B>>,
}

impl<B: UsbBackend> Default for ControllerRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: UsbBackend> ControllerRegistry<B> {
    pub fn new() -> Self {
        Self {
            controllers: Vec::new(),
        }
    }

    /// `Philips amBX` for the first device, `Philips amBX n` after that
    fn name_for(index: usize) -> String {
        if index == 0 {
            BASE_NAME.to_string()
        } else {
            format!("{} {}", BASE_NAME, index + 1)
        }
    }

    /// Wrap an initialized session and take ownership of it
    pub fn register(&mut self, session: DeviceSession<B>) -> &mut AmbxController<B> {
        let name = Self::name_for(self.controllers.len());
        info!("Registered {} at {}", name, session.location());

        let index = self.controllers.len();
        self.controllers.push(AmbxController::new(name, session));
        &mut self.controllers[index]
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&AmbxController<B>> {
        self.controllers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut AmbxController<B>> {
        self.controllers.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AmbxController<B>> {
        self.controllers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AmbxController<B>> {
        self.controllers.iter_mut()
    }

    /// Tear down every controller in registration order
    pub fn clear(&mut self) {
        for controller in self.controllers.drain(..) {
            drop(controller);
        }
    }
}
