//! amBX packet construction
//!
//! All packets go to the interrupt OUT endpoint. Two shapes exist:
//!
//! ```text
//! single:  [0xA1][zone][0x03][r][g][b]
//! batched: [header]([zone][0x03][r][g][b]) x 1..=5
//! ```
//!
//! Packets are built into a fixed 26-byte buffer; the largest batch is
//! `1 + 5 * 5` bytes so nothing is heap allocated.

use crate::error::{ProtocolError, Result};
use crate::types::{ColorCommand, Rgb, Zone};
use std::ops::Deref;

/// Header byte of a single-light packet
pub const PACKET_HEADER: u8 = 0xA1;

/// Command code: set color
pub const SET_COLOR: u8 = 0x03;

/// Bytes per light in a packet body (zone, command, r, g, b)
pub const LIGHT_RECORD_LEN: usize = 5;

/// Length of a single-light packet
pub const SINGLE_PACKET_LEN: usize = 1 + LIGHT_RECORD_LEN;

/// Maximum number of lights in one batch packet
pub const MAX_BATCH_LIGHTS: usize = 5;

/// Maximum packet length
pub const MAX_PACKET_LEN: usize = 1 + MAX_BATCH_LIGHTS * LIGHT_RECORD_LEN;

/// Batch header values observed in USB traces, in the order the vendor
/// software emits them
pub const ROTATING_BATCH_HEADERS: [u8; 8] = [0xA4, 0xC4, 0xE4, 0x04, 0x24, 0x44, 0x64, 0x84];

/// Wire packet in a fixed-capacity buffer
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    buf: [u8; MAX_PACKET_LEN],
    len: usize,
}

impl Packet {
    fn with_header(header: u8) -> Self {
        let mut buf = [0u8; MAX_PACKET_LEN];
        buf[0] = header;
        Self { buf, len: 1 }
    }

    fn push_light(&mut self, cmd: &ColorCommand) {
        let record = [cmd.zone.id(), SET_COLOR, cmd.color.r, cmd.color.g, cmd.color.b];
        self.buf[self.len..self.len + LIGHT_RECORD_LEN].copy_from_slice(&record);
        self.len += LIGHT_RECORD_LEN;
    }

    /// Header byte
    pub fn header(&self) -> u8 {
        self.buf[0]
    }

    /// Number of light records carried
    pub fn light_count(&self) -> usize {
        (self.len - 1) / LIGHT_RECORD_LEN
    }

    /// Encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Deref for Packet {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet({:02x?})", self.as_bytes())
    }
}

/// Encode a single-light packet
pub fn encode_single(cmd: &ColorCommand) -> Packet {
    let mut packet = Packet::with_header(PACKET_HEADER);
    packet.push_light(cmd);
    packet
}

/// Encode a batch packet for 1..=5 lights
pub fn encode_batch(header: u8, cmds: &[ColorCommand]) -> Result<Packet> {
    if cmds.is_empty() || cmds.len() > MAX_BATCH_LIGHTS {
        return Err(ProtocolError::InvalidBatchSize {
            count: cmds.len(),
            max: MAX_BATCH_LIGHTS,
        });
    }

    Ok(batch_unchecked(header, cmds))
}

// Caller guarantees 1..=MAX_BATCH_LIGHTS commands
fn batch_unchecked(header: u8, cmds: &[ColorCommand]) -> Packet {
    let mut packet = Packet::with_header(header);
    for cmd in cmds {
        packet.push_light(cmd);
    }
    packet
}

/// Build a single-light packet from a raw zone id
///
/// # Example
/// ```
/// use ambx_protocol::single_color_packet;
///
/// let packet = single_color_packet(0x0B, 255, 0, 0).unwrap();
/// assert_eq!(packet.as_bytes(), &[0xA1, 0x0B, 0x03, 255, 0, 0]);
/// assert!(single_color_packet(0x42, 255, 0, 0).is_err());
/// ```
pub fn single_color_packet(zone_id: u8, r: u8, g: u8, b: u8) -> Result<Packet> {
    let cmd = ColorCommand::from_raw(zone_id, Rgb::new(r, g, b))?;
    Ok(encode_single(&cmd))
}

/// Build a batch packet from raw zone ids
///
/// Every zone id is validated before any byte is written.
pub fn batch_color_packet(header: u8, zone_ids: &[u8], colors: &[Rgb]) -> Result<Packet> {
    if zone_ids.is_empty() || zone_ids.len() > MAX_BATCH_LIGHTS {
        return Err(ProtocolError::InvalidBatchSize {
            count: zone_ids.len(),
            max: MAX_BATCH_LIGHTS,
        });
    }
    let cmds = ColorCommand::pair_raw(zone_ids, colors)?;
    encode_batch(header, &cmds)
}

/// Source of batch header bytes
///
/// The header is not meaningful for color control, but the vendor software
/// rotates through [`ROTATING_BATCH_HEADERS`]. State is owned by whoever
/// builds the packets, usually one per device session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchHeaders {
    /// Always use the same header byte
    Fixed(u8),
    /// Cycle through the observed header values
    Rotating { next: usize },
}

impl Default for BatchHeaders {
    fn default() -> Self {
        Self::rotating()
    }
}

impl BatchHeaders {
    pub fn rotating() -> Self {
        Self::Rotating { next: 0 }
    }

    /// Header for the next batch packet
    pub fn next_header(&mut self) -> u8 {
        match self {
            Self::Fixed(header) => *header,
            Self::Rotating { next } => {
                let header = ROTATING_BATCH_HEADERS[*next];
                *next = (*next + 1) % ROTATING_BATCH_HEADERS.len();
                header
            }
        }
    }
}

/// Packets needed to apply `cmds`, in order
///
/// Commands are split into chunks of [`MAX_BATCH_LIGHTS`]. A chunk of one
/// light uses the single-light framing; larger chunks become batch packets.
pub fn plan_packets(cmds: &[ColorCommand], headers: &mut BatchHeaders) -> Vec<Packet> {
    cmds.chunks(MAX_BATCH_LIGHTS)
        .map(|chunk| match chunk {
            [only] => encode_single(only),
            many => batch_unchecked(headers.next_header(), many),
        })
        .collect()
}

/// Commands that set all five physical lights to `color`
pub fn all_lights(color: Rgb) -> [ColorCommand; 5] {
    Zone::LIGHTS.map(|zone| ColorCommand::new(zone, color))
}
