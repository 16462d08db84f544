//! Primitive field encoding shared by requests and replies

use crate::error::{ProtoError, ProtoResult};
use bytes::{Buf, BufMut};

pub fn put_string(buf: &mut impl BufMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

pub fn get_string(buf: &mut impl Buf, field: &'static str) -> ProtoResult<String> {
    let chunk = buf.chunk();
    let end = chunk
        .iter()
        .position(|b| *b == 0)
        .ok_or(ProtoError::Truncated(field))?;
    let value = std::str::from_utf8(&chunk[..end])
        .map_err(|_| ProtoError::InvalidUtf8)?
        .to_string();
    buf.advance(end + 1);
    Ok(value)
}

/// Empty string stands for "not set"
pub fn put_opt_string(buf: &mut impl BufMut, value: Option<&str>) {
    put_string(buf, value.unwrap_or(""));
}

pub fn get_opt_string(buf: &mut impl Buf, field: &'static str) -> ProtoResult<Option<String>> {
    let value = get_string(buf, field)?;
    Ok((!value.is_empty()).then_some(value))
}

pub fn get_u8(buf: &mut impl Buf, field: &'static str) -> ProtoResult<u8> {
    if buf.remaining() < 1 {
        return Err(ProtoError::Truncated(field));
    }
    Ok(buf.get_u8())
}

pub fn get_u32(buf: &mut impl Buf, field: &'static str) -> ProtoResult<u32> {
    if buf.remaining() < 4 {
        return Err(ProtoError::Truncated(field));
    }
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut impl Buf, field: &'static str) -> ProtoResult<u64> {
    if buf.remaining() < 8 {
        return Err(ProtoError::Truncated(field));
    }
    Ok(buf.get_u64())
}

pub fn get_bool(buf: &mut impl Buf, field: &'static str) -> ProtoResult<bool> {
    match get_u8(buf, field)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtoError::Malformed(format!("{field}: bad boolean {other}"))),
    }
}

/// Optional integers carry a presence byte
pub fn put_opt_u64(buf: &mut impl BufMut, value: Option<u64>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64(v);
        }
        None => buf.put_u8(0),
    }
}

pub fn get_opt_u64(buf: &mut impl Buf, field: &'static str) -> ProtoResult<Option<u64>> {
    if get_bool(buf, field)? {
        get_u64(buf, field).map(Some)
    } else {
        Ok(None)
    }
}

pub fn put_string_list(buf: &mut impl BufMut, values: &[String]) {
    buf.put_u32(u32::try_from(values.len()).unwrap_or(u32::MAX));
    for value in values {
        put_string(buf, value);
    }
}

/// Lists are bounded by what is left in the message, so a bogus count
/// cannot make the decoder allocate more than the frame itself.
pub fn get_string_list(buf: &mut impl Buf, field: &'static str) -> ProtoResult<Vec<String>> {
    let count = get_u32(buf, field)? as usize;
    if count > buf.remaining() {
        return Err(ProtoError::Truncated(field));
    }
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(get_string(buf, field)?);
    }
    Ok(values)
}

/// Remaining items are bounded the same way as string lists
pub fn get_count(buf: &mut impl Buf, field: &'static str) -> ProtoResult<usize> {
    let count = get_u32(buf, field)? as usize;
    if count > buf.remaining() {
        return Err(ProtoError::Truncated(field));
    }
    Ok(count)
}

pub fn put_count(buf: &mut impl BufMut, count: usize) {
    buf.put_u32(u32::try_from(count).unwrap_or(u32::MAX));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_string_needs_terminator() {
        let mut buf = BytesMut::from(&b"abc"[..]);
        assert!(matches!(
            get_string(&mut buf, "name"),
            Err(ProtoError::Truncated("name"))
        ));
    }

    #[test]
    fn test_list_count_bounded_by_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(10_000);
        buf.put_slice(b"a\0");
        assert!(get_string_list(&mut buf, "paths").is_err());
    }

    #[test]
    fn test_optional_fields() {
        let mut buf = BytesMut::new();
        put_opt_string(&mut buf, None);
        put_opt_u64(&mut buf, Some(42));
        put_opt_u64(&mut buf, None);
        assert_eq!(get_opt_string(&mut buf, "s").unwrap(), None);
        assert_eq!(get_opt_u64(&mut buf, "a").unwrap(), Some(42));
        assert_eq!(get_opt_u64(&mut buf, "b").unwrap(), None);
        assert!(buf.is_empty());
    }
}
