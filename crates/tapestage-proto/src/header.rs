//! Message header, magic numbers and request types

use crate::error::{ProtoError, ProtoResult};
use bytes::{Buf, BufMut};

/// Legacy clients
pub const MAGIC_V1: u32 = 0x1314_0701;
/// Adds the API request variants
pub const MAGIC_V2: u32 = 0x1314_0702;
/// Adds get, file-change and ping
pub const MAGIC_V3: u32 = 0x1314_0703;
/// Adds the API shutdown request
pub const MAGIC_V4: u32 = 0x1314_0704;

/// Size of the fixed message header
pub const HEADER_LEN: usize = 12;

/// Default limit for a single message
pub const MAX_MESSAGE_SIZE: usize = 1_000_000;

/// Offset added to a request type by its API variant
const API_OFFSET: u32 = 100;

/// Client request types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestType {
    StageIn = 1,
    StageOut = 2,
    StageWrite = 3,
    StagePut = 4,
    Query = 5,
    Clear = 6,
    Kill = 7,
    UpdateCallback = 8,
    Init = 9,
    Catalog = 10,
    Alloc = 11,
    Get = 12,
    FileChange = 13,
    Shutdown = 14,
    Ping = 15,
}

impl RequestType {
    fn from_base(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::StageIn,
            2 => Self::StageOut,
            3 => Self::StageWrite,
            4 => Self::StagePut,
            5 => Self::Query,
            6 => Self::Clear,
            7 => Self::Kill,
            8 => Self::UpdateCallback,
            9 => Self::Init,
            10 => Self::Catalog,
            11 => Self::Alloc,
            12 => Self::Get,
            13 => Self::FileChange,
            14 => Self::Shutdown,
            15 => Self::Ping,
            _ => return None,
        })
    }

    /// Request types that create catalog entries
    #[must_use]
    pub const fn is_stage(self) -> bool {
        matches!(
            self,
            Self::StageIn | Self::StageOut | Self::StageWrite | Self::Catalog | Self::Alloc
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::StageIn => "stagein",
            Self::StageOut => "stageout",
            Self::StageWrite => "stagewrt",
            Self::StagePut => "stageput",
            Self::Query => "stageqry",
            Self::Clear => "stageclr",
            Self::Kill => "stagekill",
            Self::UpdateCallback => "stageupdc",
            Self::Init => "stageinit",
            Self::Catalog => "stagecat",
            Self::Alloc => "stagealloc",
            Self::Get => "stageget",
            Self::FileChange => "stagechng",
            Self::Shutdown => "stageshutdown",
            Self::Ping => "stageping",
        }
    }
}

/// Request type together with its legacy/API variant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub request: RequestType,
    pub api: bool,
}

impl MessageType {
    #[must_use]
    pub const fn legacy(request: RequestType) -> Self {
        Self {
            request,
            api: false,
        }
    }

    #[must_use]
    pub const fn api(request: RequestType) -> Self {
        Self { request, api: true }
    }

    #[must_use]
    pub const fn wire_value(self) -> u32 {
        if self.api {
            self.request as u32 + API_OFFSET
        } else {
            self.request as u32
        }
    }

    pub fn from_wire(value: u32) -> ProtoResult<Self> {
        let (base, api) = if value > API_OFFSET {
            (value - API_OFFSET, true)
        } else {
            (value, false)
        };
        RequestType::from_base(base)
            .map(|request| Self { request, api })
            .ok_or(ProtoError::UnknownRequestType(value))
    }

    /// Oldest magic that may carry this message type
    #[must_use]
    pub const fn min_magic(self) -> u32 {
        match (self.request, self.api) {
            (RequestType::Shutdown, true) => MAGIC_V4,
            (RequestType::Get | RequestType::FileChange | RequestType::Ping, _) => MAGIC_V3,
            (_, true) => MAGIC_V2,
            (_, false) => MAGIC_V1,
        }
    }

    /// Reject message types the client's protocol revision cannot send
    pub fn check_magic(self, magic: u32) -> ProtoResult<()> {
        if magic < self.min_magic() {
            return Err(ProtoError::NotAccepted {
                request_type: self.wire_value(),
                magic,
            });
        }
        Ok(())
    }
}

/// Known magic numbers, oldest first
#[must_use]
pub const fn is_known_magic(magic: u32) -> bool {
    matches!(magic, MAGIC_V1 | MAGIC_V2 | MAGIC_V3 | MAGIC_V4)
}

/// Fixed header preceding every message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub message_type: u32,
    /// Length of the whole message including the header
    pub total_length: u32,
}

impl MessageHeader {
    pub fn read(buf: &mut impl Buf) -> ProtoResult<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(ProtoError::Truncated("header"));
        }
        Ok(Self {
            magic: buf.get_u32(),
            message_type: buf.get_u32(),
            total_length: buf.get_u32(),
        })
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.magic);
        buf.put_u32(self.message_type);
        buf.put_u32(self.total_length);
    }

    /// Validate the announced length against the header size and a limit
    pub fn body_len(&self, max: usize) -> ProtoResult<usize> {
        let total = self.total_length as usize;
        if total < HEADER_LEN {
            return Err(ProtoError::BadLength(total));
        }
        if total > max {
            return Err(ProtoError::TooLarge { len: total, max });
        }
        Ok(total - HEADER_LEN)
    }
}
