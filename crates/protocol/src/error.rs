//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// All of these are usage errors raised before anything reaches the
/// hardware.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Zone identifier outside the amBX light vocabulary
    #[error("Invalid amBX zone id {0:#04x}")]
    InvalidZone(u8),

    /// Zone name that does not map to a light
    #[error("Unknown zone name '{0}'")]
    UnknownZoneName(String),

    /// Batch packet with no lights or more than fit in one transfer
    #[error("Invalid batch size: {count} lights (must be 1..={max})")]
    InvalidBatchSize { count: usize, max: usize },

    /// Zone and color slices of different lengths
    #[error("Length mismatch: {zones} zones but {colors} colors")]
    LengthMismatch { zones: usize, colors: usize },

    /// Color string that is not `rrggbb` hex
    #[error("Invalid color '{0}', expected rrggbb hex (e.g. 'ff8000')")]
    InvalidColor(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
