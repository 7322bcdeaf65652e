//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Not enough bytes for a packet or continuation header
    #[error("malformed header: need {needed} bytes, got {got}")]
    MalformedHeader {
        /// Bytes required by the header
        needed: usize,
        /// Bytes available
        got: usize,
    },

    /// Message type outside the defined set
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Payload shorter than its fixed layout
    #[error("malformed {payload} payload: need {needed} bytes, got {got}")]
    MalformedPayload {
        /// Payload name
        payload: &'static str,
        /// Bytes required by the layout
        needed: usize,
        /// Bytes available
        got: usize,
    },

    /// Reassembled message grew past the configured limit
    #[error("reassembly overflow: {size} bytes exceeds limit of {max}")]
    ReassemblyOverflow {
        /// Bytes collected so far
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Payload does not fit the field or write it is destined for
    #[error("payload too large: {size} bytes, limit {max}")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Allowed size
        max: usize,
    },

    /// Link write unit too small to carry a packet header and data
    #[error("invalid link write unit {0}")]
    InvalidWriteUnit(usize),
}
