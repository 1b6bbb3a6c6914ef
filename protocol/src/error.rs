use thiserror::Error;

/// Failure modes for encoding, decoding, and framing a [`crate::Envelope`].
///
/// Every variant here is recoverable by the caller per spec: a decode
/// failure or oversized frame should be logged and the read loop should
/// continue, never tear down the connection on its own.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("frame of {actual} bytes exceeds the {limit} byte cap")]
    FrameTooLarge { limit: usize, actual: usize },

    #[error("io error reading frame: {0}")]
    Io(#[from] std::io::Error),
}
