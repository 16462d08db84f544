//! Replies sent back to clients

use crate::error::{ProtoError, ProtoResult};
use crate::snapshot::EntrySnapshot;
use crate::wire::{get_string, get_u32, get_u64, put_string};
use bytes::{Buf, BufMut};
use tapestage_common::StatusCode;

const REPLY_INFO: u32 = 0;
const REPLY_ERROR: u32 = 1;
const REPLY_STATUS: u32 = 2;
const REPLY_SYMLINK: u32 = 3;
const REPLY_RMSYMLINK: u32 = 4;
const REPLY_ENTRY: u32 = 5;
const REPLY_UNIQUE_ID: u32 = 6;

/// One reply frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Informational line
    Info(String),
    /// Error line, does not end the call
    Error(String),
    /// Ask the client to create `user_path` pointing at `internal_path`
    CreateSymlink {
        internal_path: String,
        user_path: String,
    },
    /// Ask the client to remove a link it created earlier
    RemoveSymlink { user_path: String },
    /// Catalog entry, sent to API clients only
    Entry(Box<EntrySnapshot>),
    /// Correlation id of an API call, usable with kill
    UniqueId(u64),
    /// Terminal status, exactly one per call
    Status(StatusCode),
}

impl Reply {
    #[must_use]
    pub const fn wire_type(&self) -> u32 {
        match self {
            Self::Info(_) => REPLY_INFO,
            Self::Error(_) => REPLY_ERROR,
            Self::Status(_) => REPLY_STATUS,
            Self::CreateSymlink { .. } => REPLY_SYMLINK,
            Self::RemoveSymlink { .. } => REPLY_RMSYMLINK,
            Self::Entry(_) => REPLY_ENTRY,
            Self::UniqueId(_) => REPLY_UNIQUE_ID,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Status(_))
    }

    pub fn encode_body(&self, buf: &mut impl BufMut) -> ProtoResult<()> {
        match self {
            Self::Info(line) | Self::Error(line) => put_string(buf, line),
            Self::Status(code) => buf.put_u32(code.as_u32()),
            Self::CreateSymlink {
                internal_path,
                user_path,
            } => {
                put_string(buf, internal_path);
                put_string(buf, user_path);
            }
            Self::RemoveSymlink { user_path } => put_string(buf, user_path),
            Self::Entry(entry) => buf.put_slice(&bincode::serialize(entry.as_ref())?),
            Self::UniqueId(id) => buf.put_u64(*id),
        }
        Ok(())
    }

    pub fn decode_body(wire_type: u32, buf: &mut impl Buf) -> ProtoResult<Self> {
        Ok(match wire_type {
            REPLY_INFO => Self::Info(get_string(buf, "info")?),
            REPLY_ERROR => Self::Error(get_string(buf, "error")?),
            REPLY_STATUS => {
                let raw = get_u32(buf, "status")?;
                Self::Status(
                    StatusCode::try_from(raw)
                        .map_err(|v| ProtoError::Malformed(format!("unknown status {v}")))?,
                )
            }
            REPLY_SYMLINK => Self::CreateSymlink {
                internal_path: get_string(buf, "internal path")?,
                user_path: get_string(buf, "user path")?,
            },
            REPLY_RMSYMLINK => Self::RemoveSymlink {
                user_path: get_string(buf, "user path")?,
            },
            REPLY_ENTRY => {
                let entry: EntrySnapshot = bincode::deserialize(buf.chunk())?;
                buf.advance(buf.remaining());
                Self::Entry(Box::new(entry))
            }
            REPLY_UNIQUE_ID => Self::UniqueId(get_u64(buf, "unique id")?),
            other => return Err(ProtoError::UnknownReplyType(other)),
        })
    }
}
