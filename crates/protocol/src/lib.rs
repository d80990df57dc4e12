//! Wire protocol for Philips amBX gaming lights
//!
//! This crate defines the zones the amBX can address, the color type, and
//! the packet framing used on the device's interrupt OUT endpoint. It has no
//! USB dependency; packets are plain byte buffers.
//!
//! # Example
//!
//! ```
//! use ambx_protocol::{BatchHeaders, ColorCommand, Rgb, Zone, plan_packets};
//!
//! let cmds = [
//!     ColorCommand::new(Zone::LeftSatellite, Rgb::new(255, 0, 0)),
//!     ColorCommand::new(Zone::RightSatellite, Rgb::new(0, 0, 255)),
//! ];
//! let mut headers = BatchHeaders::Fixed(0xA4);
//! let packets = plan_packets(&cmds, &mut headers);
//!
//! assert_eq!(packets.len(), 1);
//! assert_eq!(
//!     packets[0].as_bytes(),
//!     &[0xA4, 0x0B, 0x03, 255, 0, 0, 0x1B, 0x03, 0, 0, 255]
//! );
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    BatchHeaders, LIGHT_RECORD_LEN, MAX_BATCH_LIGHTS, MAX_PACKET_LEN, PACKET_HEADER,
    ROTATING_BATCH_HEADERS, SET_COLOR, SINGLE_PACKET_LEN, Packet, all_lights,
    batch_color_packet, encode_batch, encode_single, plan_packets, single_color_packet,
};
pub use error::{ProtocolError, Result};
pub use types::{ColorCommand, Rgb, Zone};

/// USB vendor id shared by Philips and rebadged amBX units
pub const AMBX_VID: u16 = 0x0471;

/// USB product id of the amBX gaming lights
pub const AMBX_PID: u16 = 0x083F;
