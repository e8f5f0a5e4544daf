//! # Error Types
//!
//! Errors shared by every crate that touches the wire: framing failures while
//! reading RESP2 and codec failures while encoding or decoding tagged values.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Result type for RESP2 framing.
pub type FrameResult<T> = Result<T, FrameError>;

/// Errors raised while converting values to or from their wire form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The receiver has no decoder for this type tag.
    #[error("unknown type tag `{0}`")]
    UnknownTag(String),

    /// The value carries a different tag than the decoder expects.
    #[error("type mismatch: expected `{expected}`, found `{found}`")]
    TypeMismatch { expected: String, found: String },

    /// The type is neither registered nor matched by the auto-serialization pattern.
    #[error("type `{0}` is not registered for serialization")]
    Unregistered(String),

    /// A field was missing, renamed, reordered or of the wrong kind.
    #[error("field shape mismatch in `{type_name}`: {detail}")]
    ShapeMismatch { type_name: String, detail: String },

    /// The byte payload ended early or contained an invalid marker.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl CodecError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        CodecError::Malformed(detail.into())
    }
}

/// Errors raised while reading a RESP2 frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Network or IO failure while reading.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream before a complete frame arrived.
    #[error("connection closed by peer")]
    Eof,

    /// Invalid RESP2 framing.
    #[error("protocol error")]
    Protocol,
}
