//! Core type definitions for tapestage
//!
//! This module defines request identifiers, requester identity, request
//! kinds and modifiers, file targets (tape, disk, HSM) and the bounded
//! string types used for every externally supplied name.

use bitflags::bitflags;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest request id handed out before wrapping back to 1
pub const MAX_REQID: u32 = 999_999;

/// Maximum length of a tape volume identifier
pub const VID_MAX_LEN: usize = 6;
/// Maximum length of a tape label type (al, nl, sl, blp)
pub const LABEL_MAX_LEN: usize = 3;
/// Maximum length of a pool name
pub const POOL_NAME_MAX_LEN: usize = 15;
/// Maximum length of a tape file id
pub const FID_MAX_LEN: usize = 17;
/// Maximum length of a user-visible or internal path
pub const PATH_MAX_LEN: usize = 1023;
/// Maximum length of a host name
pub const HOST_MAX_LEN: usize = 63;

/// Seconds since the Unix epoch
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Identifier of a stage catalog entry
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct ReqId(u32);

impl ReqId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReqId({})", self.0)
    }
}

/// String with a documented maximum length.
///
/// Construction fails instead of truncating, so a name that reached the
/// catalog is always exactly what the client sent.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BoundedString<const MAX: usize>(String);

impl<const MAX: usize> BoundedString<MAX> {
    /// Create a bounded string, rejecting empty or oversized values
    pub fn new(value: impl Into<String>) -> Result<Self, BoundedStringError> {
        let value = value.into();
        if value.is_empty() {
            return Err(BoundedStringError::Empty);
        }
        if value.len() > MAX {
            return Err(BoundedStringError::TooLong {
                max: MAX,
                len: value.len(),
            });
        }
        if let Some(c) = value.chars().find(|c| *c == '\0' || c.is_control()) {
            return Err(BoundedStringError::InvalidChar(c));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl<const MAX: usize> TryFrom<String> for BoundedString<MAX> {
    type Error = BoundedStringError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<const MAX: usize> TryFrom<&str> for BoundedString<MAX> {
    type Error = BoundedStringError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<const MAX: usize> From<BoundedString<MAX>> for String {
    fn from(value: BoundedString<MAX>) -> Self {
        value.0
    }
}

impl<const MAX: usize> AsRef<str> for BoundedString<MAX> {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<const MAX: usize> fmt::Debug for BoundedString<MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl<const MAX: usize> fmt::Display for BoundedString<MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors that can occur when building a bounded string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundedStringError {
    #[error("value must not be empty")]
    Empty,
    #[error("value is {len} bytes long, at most {max} allowed")]
    TooLong { max: usize, len: usize },
    #[error("value contains invalid character: {0:?}")]
    InvalidChar(char),
}

pub type Vid = BoundedString<VID_MAX_LEN>;
pub type Label = BoundedString<LABEL_MAX_LEN>;
pub type PoolName = BoundedString<POOL_NAME_MAX_LEN>;
pub type FileId = BoundedString<FID_MAX_LEN>;
pub type StagePath = BoundedString<PATH_MAX_LEN>;
pub type HostName = BoundedString<HOST_MAX_LEN>;

/// Identity of the user on whose behalf a request runs
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requester {
    pub user: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
}

impl Requester {
    #[must_use]
    pub fn new(user: impl Into<String>, group: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            user: user.into(),
            group: group.into(),
            uid,
            gid,
        }
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// What a catalog entry was created for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Recall from tape or HSM into the disk cache
    StageIn,
    /// Disk space handed to a client that will write a new file
    StageOut,
    /// Existing disk file being written to tape or HSM
    StageWrite,
    /// Written file being migrated
    StagePut,
    /// Scratch disk allocation
    StageAlloc,
    /// Disk file registered as a copy of a tape file
    StageCatalogued,
}

impl RequestKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StageIn => "STAGEIN",
            Self::StageOut => "STAGEOUT",
            Self::StageWrite => "STAGEWRT",
            Self::StagePut => "STAGEPUT",
            Self::StageAlloc => "STAGEALLOC",
            Self::StageCatalogued => "STAGECAT",
        }
    }

    /// Kinds produced by a client writing a new file
    #[must_use]
    pub const fn is_stage_out_family(self) -> bool {
        matches!(self, Self::StageOut | Self::StageWrite | Self::StagePut)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Modifier flags combined with a [`RequestKind`] to form the entry state
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Modifiers: u16 {
        const STAGED = 1 << 0;
        const WAITING_SPACE = 1 << 1;
        const CAN_BE_MIGRATED = 1 << 2;
        const PUT_FAILED = 1 << 3;
        const STAGED_PARTIAL = 1 << 4;
        const STAGED_TRUNCATED = 1 << 5;
        const WAITING_NAMESPACE = 1 << 6;
        const LAST_TAPE_FILE = 1 << 7;
        const READ_ONLY_STAGED = 1 << 8;
    }
}

impl fmt::Display for Modifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join("|"))
    }
}

/// Position of a file on a tape
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileSeq {
    /// Exact file sequence number
    Number(u32),
    /// Open range starting at the given sequence (concat-on-demand continuation)
    From(u32),
    /// Position unknown, the file is selected by its file id (`u`)
    ByFileId,
    /// Append after the last file on the tape (`n`)
    Append,
}

impl FileSeq {
    /// Whether this position can stand for `requested` when looking up a live entry
    #[must_use]
    pub const fn covers(self, requested: Self) -> bool {
        match (self, requested) {
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::From(a), Self::Number(b) | Self::From(b)) => b >= a,
            _ => false,
        }
    }

    #[must_use]
    pub const fn number(self) -> Option<u32> {
        match self {
            Self::Number(n) | Self::From(n) => Some(n),
            Self::ByFileId | Self::Append => None,
        }
    }
}

impl fmt::Display for FileSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::From(n) => write!(f, "{n}-"),
            Self::ByFileId => f.write_str("u"),
            Self::Append => f.write_str("n"),
        }
    }
}

impl FromStr for FileSeq {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "u" => Ok(Self::ByFileId),
            "n" => Ok(Self::Append),
            _ => {
                let (digits, open) = s.strip_suffix('-').map_or((s, false), |d| (d, true));
                let n: u32 = digits
                    .parse()
                    .map_err(|_| format!("invalid file sequence: {s}"))?;
                if n == 0 {
                    return Err(format!("file sequence must be positive: {s}"));
                }
                Ok(if open { Self::From(n) } else { Self::Number(n) })
            }
        }
    }
}

/// A file on tape
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TapeTarget {
    pub vid: Vid,
    pub side: u8,
    pub fseq: FileSeq,
    pub label: Label,
    /// File id, used when `fseq` is [`FileSeq::ByFileId`]
    pub fid: Option<FileId>,
}

impl TapeTarget {
    /// Whether `self` (a live entry) matches a request for `other`
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        if self.vid != other.vid || self.side != other.side || self.label != other.label {
            return false;
        }
        match (self.fseq, other.fseq) {
            (FileSeq::ByFileId, FileSeq::ByFileId) => {
                self.fid.is_some() && self.fid == other.fid
            }
            (mine, theirs) => mine.covers(theirs),
        }
    }
}

/// A file on a filesystem outside the disk cache
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskTarget {
    pub external_path: StagePath,
}

/// Which HSM a file belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HsmSystem {
    /// The tape-backed namespace served alongside this daemon
    #[default]
    Native,
    /// A third-party HSM reached through its own mover
    Foreign,
}

/// A file in a tape-backed namespace
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HsmTarget {
    pub path: StagePath,
    pub server: String,
    /// Namespace file id, 0 until the namespace has registered the file
    pub file_id: u64,
    pub file_class: u32,
    pub system: HsmSystem,
}

impl HsmTarget {
    /// Identity that survives a rename in the namespace
    #[must_use]
    pub fn same_file(&self, other: &Self) -> bool {
        self.file_id != 0 && self.file_id == other.file_id && self.server == other.server
    }
}

/// Where the data of a catalog entry lives outside the disk cache
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Tape(TapeTarget),
    Disk(DiskTarget),
    Hsm(HsmTarget),
}

impl Target {
    #[must_use]
    pub const fn is_hsm(&self) -> bool {
        matches!(self, Self::Hsm(_))
    }

    #[must_use]
    pub const fn as_tape(&self) -> Option<&TapeTarget> {
        match self {
            Self::Tape(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_hsm(&self) -> Option<&HsmTarget> {
        match self {
            Self::Hsm(h) => Some(h),
            _ => None,
        }
    }

    /// File class used for retention and migration delay lookups
    #[must_use]
    pub const fn file_class(&self) -> Option<u32> {
        match self {
            Self::Hsm(h) => Some(h.file_class),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tape(t) => {
                write!(f, "{}/{}/{}", t.vid, t.fseq, t.label)?;
                if let Some(fid) = &t.fid {
                    write!(f, " fid={fid}")?;
                }
                Ok(())
            }
            Self::Disk(d) => f.write_str(d.external_path.as_str()),
            Self::Hsm(h) => write!(f, "{}:{}", h.server, h.path),
        }
    }
}

/// Pool an entry was placed in
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolAssignment {
    Named(PoolName),
    /// Explicitly outside every pool
    NoPool,
}

impl PoolAssignment {
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name.as_str()),
            Self::NoPool => None,
        }
    }
}

impl fmt::Display for PoolAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name.as_str()),
            Self::NoPool => f.write_str("NOPOOL"),
        }
    }
}

/// Pool requirement expressed by a client
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolConstraint {
    /// Any pooled entry is acceptable
    #[default]
    Any,
    Named(PoolName),
    /// Only entries that live outside every pool
    NoPool,
}

impl PoolConstraint {
    /// Parse the pool option of a client request
    pub fn parse(value: &str) -> Result<Self, BoundedStringError> {
        match value {
            "" => Ok(Self::Any),
            "NOPOOL" => Ok(Self::NoPool),
            name => Ok(Self::Named(PoolName::new(name)?)),
        }
    }

    #[must_use]
    pub fn accepts(&self, pool: &PoolAssignment) -> bool {
        match (self, pool) {
            (Self::Any, PoolAssignment::Named(_)) | (Self::NoPool, PoolAssignment::NoPool) => true,
            (Self::Named(want), PoolAssignment::Named(have)) => want == have,
            _ => false,
        }
    }
}

impl fmt::Display for PoolConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Named(name) => f.write_str(name.as_str()),
            Self::NoPool => f.write_str("NOPOOL"),
        }
    }
}

/// How an allocation will mostly be used, selects the pool policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocMode {
    /// Data will be read by clients after it lands (recalls)
    Read,
    /// Data will be written by clients (stage-out, alloc)
    Write,
}
