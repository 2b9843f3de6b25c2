//! Wire primitives shared by the frame codec and the per-type message
//! codecs.
//!
//! Every message type implements [`Encodable`]/[`Decodable`] over its frame
//! payload; the helpers here cover the primitive shapes the wire format is
//! built from: fixed-width integers and length-prefixed strings and byte
//! chunks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use std::mem::size_of;
use thiserror::Error;

/// Trait for message bodies that can be encoded into a frame payload.
pub trait Encodable {
    /// Encode this message body into the buffer.
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError>;

    /// Calculate the encoded size without keeping the bytes.
    fn encoded_size(&self) -> usize {
        let mut buf = BytesMut::new();
        self.encode(&mut buf).map(|_| buf.len()).unwrap_or(0)
    }

    /// Encode into a fresh payload buffer.
    fn to_payload(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Trait for message bodies that can be decoded from a frame payload.
pub trait Decodable: Sized {
    /// Decode this message body from the buffer.
    fn decode(src: &mut Cursor<&[u8]>) -> Result<Self, CodecError>;
}

/// Codec errors with enough context to point at the offending field.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("frame of {0} bytes exceeds the 64KB frame limit")]
    FrameTooLarge(usize),

    #[error("frame size {0} is below the 7 byte minimum")]
    FrameTooSmall(usize),

    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("unknown checksum type {0:#04x}")]
    UnknownChecksumType(u8),

    #[error("unknown error code {0:#04x}")]
    UnknownErrorCode(u8),

    #[error("field '{field}' of {len} bytes does not fit its length prefix")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("invalid UTF-8 in field '{field}'")]
    Utf8 {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("trailing bytes after {0} payload")]
    TrailingBytes(&'static str),
}

/// Get a u8 from the buffer.
pub(crate) fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, CodecError> {
    src.has_remaining()
        .then(|| src.get_u8())
        .ok_or(CodecError::Incomplete)
}

/// Get a big-endian u16 from the buffer.
pub(crate) fn get_u16(src: &mut Cursor<&[u8]>) -> Result<u16, CodecError> {
    (src.remaining() >= size_of::<u16>())
        .then(|| src.get_u16())
        .ok_or(CodecError::Incomplete)
}

/// Get a big-endian u32 from the buffer.
pub(crate) fn get_u32(src: &mut Cursor<&[u8]>) -> Result<u32, CodecError> {
    (src.remaining() >= size_of::<u32>())
        .then(|| src.get_u32())
        .ok_or(CodecError::Incomplete)
}

/// Get a big-endian u64 from the buffer.
pub(crate) fn get_u64(src: &mut Cursor<&[u8]>) -> Result<u64, CodecError> {
    (src.remaining() >= size_of::<u64>())
        .then(|| src.get_u64())
        .ok_or(CodecError::Incomplete)
}

/// Copy `n` bytes out of the buffer.
pub(crate) fn get_bytes(src: &mut Cursor<&[u8]>, n: usize) -> Result<Bytes, CodecError> {
    (src.remaining() >= n)
        .then(|| src.copy_to_bytes(n))
        .ok_or(CodecError::Incomplete)
}

/// Get a string with a one-byte length prefix (`~1` in wire notation).
pub(crate) fn get_str1(
    src: &mut Cursor<&[u8]>,
    field: &'static str,
) -> Result<String, CodecError> {
    let len = get_u8(src)? as usize;
    utf8(get_bytes(src, len)?, field)
}

/// Get a string with a two-byte length prefix (`~2`).
pub(crate) fn get_str2(
    src: &mut Cursor<&[u8]>,
    field: &'static str,
) -> Result<String, CodecError> {
    let len = get_u16(src)? as usize;
    utf8(get_bytes(src, len)?, field)
}

/// Get an opaque byte chunk with a two-byte length prefix.
pub(crate) fn get_chunk2(src: &mut Cursor<&[u8]>) -> Result<Bytes, CodecError> {
    let len = get_u16(src)? as usize;
    get_bytes(src, len)
}

/// Put a string with a one-byte length prefix.
pub(crate) fn put_str1(
    buf: &mut BytesMut,
    value: &str,
    field: &'static str,
) -> Result<(), CodecError> {
    let len = value.len();
    if len > u8::MAX as usize {
        return Err(CodecError::FieldTooLong { field, len });
    }
    buf.put_u8(len as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Put a string with a two-byte length prefix.
pub(crate) fn put_str2(
    buf: &mut BytesMut,
    value: &str,
    field: &'static str,
) -> Result<(), CodecError> {
    let len = value.len();
    if len > u16::MAX as usize {
        return Err(CodecError::FieldTooLong { field, len });
    }
    buf.put_u16(len as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Put an opaque byte chunk with a two-byte length prefix.
pub(crate) fn put_chunk2(
    buf: &mut BytesMut,
    value: &[u8],
    field: &'static str,
) -> Result<(), CodecError> {
    let len = value.len();
    if len > u16::MAX as usize {
        return Err(CodecError::FieldTooLong { field, len });
    }
    buf.put_u16(len as u16);
    buf.put_slice(value);
    Ok(())
}

fn utf8(bytes: Bytes, field: &'static str) -> Result<String, CodecError> {
    String::from_utf8(bytes.into()).map_err(|source| CodecError::Utf8 { field, source })
}
