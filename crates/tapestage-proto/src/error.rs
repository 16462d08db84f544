//! Protocol errors

use thiserror::Error;

pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors raised while framing or parsing messages
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown magic number {0:#x}")]
    UnknownMagic(u32),

    #[error("unknown request type {0}")]
    UnknownRequestType(u32),

    #[error("unknown reply type {0}")]
    UnknownReplyType(u32),

    #[error("request type {request_type} requires a newer magic than {magic:#x}")]
    NotAccepted { request_type: u32, magic: u32 },

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("message length {0} is shorter than the header")]
    BadLength(usize),

    #[error("message truncated while reading {0}")]
    Truncated(&'static str),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtoError {
    /// Errors caused by what the peer sent, as opposed to local I/O
    #[must_use]
    pub const fn is_peer_error(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}
