//! Light and color types
//!
//! The amBX exposes five physical lights, each addressed by a fixed one-byte
//! zone id, plus a broadcast id that addresses all of them at once.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Addressable amBX light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Zone {
    /// Left satellite speaker light
    #[serde(rename = "left")]
    LeftSatellite = 0x0B,
    /// Right satellite speaker light
    #[serde(rename = "right")]
    RightSatellite = 0x1B,
    /// Left segment of the wall washer bar
    #[serde(rename = "wall-left")]
    WallLeft = 0x2B,
    /// Center segment of the wall washer bar
    #[serde(rename = "wall-center")]
    WallCenter = 0x3B,
    /// Right segment of the wall washer bar
    #[serde(rename = "wall-right")]
    WallRight = 0x4B,
    /// Broadcast id, every light at once
    #[serde(rename = "all")]
    All = 0xFF,
}

impl Zone {
    /// The five physical lights in device order (excludes [`Zone::All`])
    pub const LIGHTS: [Zone; 5] = [
        Zone::LeftSatellite,
        Zone::RightSatellite,
        Zone::WallLeft,
        Zone::WallCenter,
        Zone::WallRight,
    ];

    /// Wire id of this zone
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Short name used on the command line and in config files
    pub const fn name(self) -> &'static str {
        match self {
            Zone::LeftSatellite => "left",
            Zone::RightSatellite => "right",
            Zone::WallLeft => "wall-left",
            Zone::WallCenter => "wall-center",
            Zone::WallRight => "wall-right",
            Zone::All => "all",
        }
    }

    /// Human-readable label
    pub const fn label(self) -> &'static str {
        match self {
            Zone::LeftSatellite => "Left",
            Zone::RightSatellite => "Right",
            Zone::WallLeft => "Wall Left",
            Zone::WallCenter => "Wall Center",
            Zone::WallRight => "Wall Right",
            Zone::All => "All",
        }
    }
}

impl TryFrom<u8> for Zone {
    type Error = ProtocolError;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0x0B => Ok(Zone::LeftSatellite),
            0x1B => Ok(Zone::RightSatellite),
            0x2B => Ok(Zone::WallLeft),
            0x3B => Ok(Zone::WallCenter),
            0x4B => Ok(Zone::WallRight),
            0xFF => Ok(Zone::All),
            other => Err(ProtocolError::InvalidZone(other)),
        }
    }
}

impl From<Zone> for u8 {
    fn from(zone: Zone) -> Self {
        zone.id()
    }
}

impl FromStr for Zone {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "left" | "left-satellite" => Ok(Zone::LeftSatellite),
            "right" | "right-satellite" => Ok(Zone::RightSatellite),
            "wall-left" => Ok(Zone::WallLeft),
            "wall-center" | "wall-centre" => Ok(Zone::WallCenter),
            "wall-right" => Ok(Zone::WallRight),
            "all" => Ok(Zone::All),
            _ => Err(ProtocolError::UnknownZoneName(s.to_string())),
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 8-bit RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    /// Black, used to switch lights off
    pub const OFF: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl FromStr for Rgb {
    type Err = ProtocolError;

    /// Parse `rrggbb`, `#rrggbb` or `0xrrggbb` (`0X` also accepted)
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let hex = trimmed
            .strip_prefix('#')
            .or_else(|| trimmed.strip_prefix("0x"))
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidColor(s.to_string()));
        }

        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|_| ProtocolError::InvalidColor(s.to_string()))
        };

        Ok(Rgb::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl TryFrom<String> for Rgb {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Rgb> for String {
    fn from(color: Rgb) -> Self {
        color.to_string()
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// A color destined for one zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorCommand {
    pub zone: Zone,
    pub color: Rgb,
}

impl ColorCommand {
    pub const fn new(zone: Zone, color: Rgb) -> Self {
        Self { zone, color }
    }

    /// Build a command from a raw zone id, rejecting unknown ids
    pub fn from_raw(zone_id: u8, color: Rgb) -> Result<Self> {
        Ok(Self::new(Zone::try_from(zone_id)?, color))
    }

    /// Pair zones with colors, validating both lengths and every zone id
    ///
    /// Nothing is returned unless every id is valid.
    pub fn pair_raw(zone_ids: &[u8], colors: &[Rgb]) -> Result<Vec<Self>> {
        if zone_ids.len() != colors.len() {
            return Err(ProtocolError::LengthMismatch {
                zones: zone_ids.len(),
                colors: colors.len(),
            });
        }

        zone_ids
            .iter()
            .zip(colors)
            .map(|(&id, &color)| Self::from_raw(id, color))
            .collect()
    }

    /// Pair typed zones with colors
    pub fn pair(zones: &[Zone], colors: &[Rgb]) -> Result<Vec<Self>> {
        if zones.len() != colors.len() {
            return Err(ProtocolError::LengthMismatch {
                zones: zones.len(),
                colors: colors.len(),
            });
        }

        Ok(zones
            .iter()
            .zip(colors)
            .map(|(&zone, &color)| Self::new(zone, color))
            .collect())
    }
}
