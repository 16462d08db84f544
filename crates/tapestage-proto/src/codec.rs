//! `tokio_util` codecs for both ends of a client connection

use crate::error::{ProtoError, ProtoResult};
use crate::header::{HEADER_LEN, MAGIC_V1, MAX_MESSAGE_SIZE, MessageHeader, MessageType, is_known_magic};
use crate::reply::Reply;
use crate::request::{Request, RequestFrame};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Pull one complete frame out of `src`, or `None` when more bytes are needed
fn split_frame(src: &mut BytesMut, max: usize) -> ProtoResult<Option<(MessageHeader, BytesMut)>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut peek = &src[..HEADER_LEN];
    let header = MessageHeader::read(&mut peek)?;
    let body_len = header.body_len(max)?;
    if src.len() < HEADER_LEN + body_len {
        src.reserve(HEADER_LEN + body_len - src.len());
        return Ok(None);
    }
    let mut frame = src.split_to(HEADER_LEN + body_len);
    let body = frame.split_off(HEADER_LEN);
    Ok(Some((header, body)))
}

/// Write a frame, filling in the total length once the body is known
fn write_frame(
    dst: &mut BytesMut,
    magic: u32,
    message_type: u32,
    body: impl FnOnce(&mut BytesMut) -> ProtoResult<()>,
) -> ProtoResult<()> {
    let start = dst.len();
    dst.put_bytes(0, HEADER_LEN);
    body(dst)?;
    let total = dst.len() - start;
    let header = MessageHeader {
        magic,
        message_type,
        total_length: u32::try_from(total).map_err(|_| ProtoError::TooLarge {
            len: total,
            max: u32::MAX as usize,
        })?,
    };
    let mut slot = &mut dst[start..start + HEADER_LEN];
    header.write(&mut slot);
    Ok(())
}

/// Stager side: decodes requests, encodes replies
#[derive(Debug, Clone)]
pub struct ServerCodec {
    max_message_size: usize,
    reply_magic: u32,
}

impl ServerCodec {
    #[must_use]
    pub const fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            reply_magic: MAGIC_V1,
        }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl Decoder for ServerCodec {
    type Item = RequestFrame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtoResult<Option<RequestFrame>> {
        let Some((header, mut body)) = split_frame(src, self.max_message_size)? else {
            return Ok(None);
        };
        if !is_known_magic(header.magic) {
            return Err(ProtoError::UnknownMagic(header.magic));
        }
        self.reply_magic = header.magic;
        let message_type = MessageType::from_wire(header.message_type)?;
        let request = Request::decode_body(message_type.request, &mut body)?;
        Ok(Some(RequestFrame {
            magic: header.magic,
            api: message_type.api,
            request,
        }))
    }
}

impl Encoder<Reply> for ServerCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> ProtoResult<()> {
        write_frame(dst, self.reply_magic, item.wire_type(), |buf| {
            item.encode_body(buf)
        })
    }
}

/// Client side: encodes requests, decodes replies
#[derive(Debug, Clone)]
pub struct ClientCodec {
    max_message_size: usize,
}

impl ClientCodec {
    #[must_use]
    pub const fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl Encoder<RequestFrame> for ClientCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> ProtoResult<()> {
        let message_type = item.message_type();
        message_type.check_magic(item.magic)?;
        write_frame(dst, item.magic, message_type.wire_value(), |buf| {
            item.request.encode_body(buf);
            Ok(())
        })
    }
}

impl Decoder for ClientCodec {
    type Item = Reply;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtoResult<Option<Reply>> {
        let Some((header, mut body)) = split_frame(src, self.max_message_size)? else {
            return Ok(None);
        };
        Reply::decode_body(header.message_type, &mut body).map(Some)
    }
}
