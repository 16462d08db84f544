//! Tapestage Proto - wire formats
//!
//! Clients talk to the stager with length-prefixed binary messages:
//!
//! ```text
//! [u32 BE magic][u32 BE request_type][u32 BE total_length][body ...]
//! ```
//!
//! `total_length` counts the 12 header bytes. The body is a sequence of
//! big-endian integers and NUL-terminated strings whose layout depends on
//! the request type. Replies use the same header with a reply type.
//!
//! Workers are spoken to with JSON lines (see [`worker`]).

pub mod codec;
pub mod error;
pub mod header;
pub mod reply;
pub mod request;
pub mod snapshot;
pub mod wire;
pub mod worker;

pub use codec::{ClientCodec, ServerCodec};
pub use error::{ProtoError, ProtoResult};
pub use header::{
    HEADER_LEN, MAGIC_V1, MAGIC_V2, MAGIC_V3, MAGIC_V4, MAX_MESSAGE_SIZE, MessageHeader,
    MessageType, RequestType,
};
pub use reply::Reply;
pub use request::*;
pub use snapshot::EntrySnapshot;
