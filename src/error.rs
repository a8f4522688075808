//! Error types shared across the crate.

use crate::codec::Protocol;
use thiserror::Error;

/// Convenience alias for results produced by this crate.
pub type NetResult<T> = Result<T, NetError>;

/// Errors surfaced by endpoints, connections, and codecs.
///
/// Errors never cross connection boundaries: an I/O failure closes the
/// connection it happened on and is reported through that connection's
/// disconnect callback, not through the endpoint.
#[derive(Debug, Error)]
pub enum NetError {
    /// No encoder factory is registered for the message type on this protocol.
    #[error("no {protocol} encoder registered for message type `{type_name}`")]
    UnregisteredEncoder {
        /// Protocol the lookup was for.
        protocol: Protocol,
        /// Full name of the message type.
        type_name: &'static str,
    },

    /// No decoder factory is registered for the message type.
    #[error("no decoder registered for message type `{type_name}`")]
    UnregisteredDecoder {
        /// Full name of the message type.
        type_name: &'static str,
    },

    /// An I/O failure reported by the underlying transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A frame announced a length of zero, which the wire format reserves.
    #[error("zero-length frame is reserved")]
    ZeroLengthFrame,

    /// A frame announced a length above the configured maximum.
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge {
        /// Announced payload length.
        length: u64,
        /// Configured maximum payload length.
        max: u32,
    },

    /// The peer closed the transport in the middle of a frame.
    #[error("truncated frame")]
    TruncatedFrame(#[source] std::io::Error),

    /// The peer closed the transport cleanly between frames.
    #[error("end of stream")]
    EndOfStream,

    /// A codec failed to serialize or deserialize a message.
    #[error("codec error: {0}")]
    Codec(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The operation targeted a connection that is closing or closed.
    #[error("connection is closed")]
    Closed,
}

impl NetError {
    /// True for the clean end-of-stream path, which closes a connection
    /// without counting as a fault.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, NetError::EndOfStream)
    }
}
