use thiserror::Error;

/// Errors raised by world mutation entry points.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WorldError {
    /// A chunk-local coordinate fell outside the fixed chunk extent.
    #[error("chunk-local coordinate ({x}, {y}) is outside the 16x16 chunk extent")]
    OutOfBounds {
        /// Offending X coordinate.
        x: u8,
        /// Offending Y coordinate.
        y: u8,
    },

    /// A layer tag outside the known set.
    #[error("unknown chunk layer tag {0}")]
    UnknownLayer(u8),
}
