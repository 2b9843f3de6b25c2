//! CALL_REQ / CALL_RES and their continuation frames.
//!
//! A logical call is one head message followed by zero or more continuations
//! sharing its id; every member but the last sets the fragment flag. Each
//! argument chunk is written as `len:u16 || bytes`, so zero-length arguments
//! survive the trip.

use crate::codec::{self, CodecError, Decodable, Encodable};
use crate::messages::common::{Checksum, Tracing};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io::Cursor;

/// Head frame of an outgoing call:
/// `flags:u1 ttl:u4 tracing:25 service~1 nh:u1 (hk~1 hv~1)* csumtype:u1
/// (csum:u4){0,1} arg~2*`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallRequest {
    pub id: u32,
    pub flags: u8,
    /// Time the caller is willing to wait, in milliseconds.
    pub ttl: u32,
    pub tracing: Tracing,
    pub service: String,
    pub headers: HashMap<String, String>,
    pub checksum: Checksum,
    pub args: Vec<Bytes>,
}

/// Head frame of a call response:
/// `flags:u1 code:u1 tracing:25 nh:u1 (hk~1 hv~1)* csumtype:u1 (csum:u4){0,1}
/// arg~2*`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallResponse {
    pub id: u32,
    pub flags: u8,
    pub code: u8,
    pub tracing: Tracing,
    pub headers: HashMap<String, String>,
    pub checksum: Checksum,
    pub args: Vec<Bytes>,
}

/// Continuation of a fragmented CALL_REQ:
/// `flags:u1 csumtype:u1 (csum:u4){0,1} arg~2*`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallRequestContinue {
    pub id: u32,
    pub flags: u8,
    pub checksum: Checksum,
    pub args: Vec<Bytes>,
}

/// Continuation of a fragmented CALL_RES.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallResponseContinue {
    pub id: u32,
    pub flags: u8,
    pub checksum: Checksum,
    pub args: Vec<Bytes>,
}

fn encode_headers(
    headers: &HashMap<String, String>,
    buf: &mut BytesMut,
) -> Result<(), CodecError> {
    if headers.len() > u8::MAX as usize {
        return Err(CodecError::FieldTooLong {
            field: "headers",
            len: headers.len(),
        });
    }
    buf.put_u8(headers.len() as u8);

    let mut keys: Vec<&String> = headers.keys().collect();
    keys.sort();
    for key in keys {
        codec::put_str1(buf, key, "header_key")?;
        codec::put_str1(buf, &headers[key], "header_value")?;
    }
    Ok(())
}

fn decode_headers(src: &mut Cursor<&[u8]>) -> Result<HashMap<String, String>, CodecError> {
    let count = codec::get_u8(src)? as usize;
    let mut headers = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = codec::get_str1(src, "header_key")?;
        let value = codec::get_str1(src, "header_value")?;
        headers.insert(key, value);
    }
    Ok(headers)
}

fn encode_args(args: &[Bytes], buf: &mut BytesMut) -> Result<(), CodecError> {
    for arg in args {
        codec::put_chunk2(buf, arg, "arg")?;
    }
    Ok(())
}

fn decode_args(src: &mut Cursor<&[u8]>) -> Result<Vec<Bytes>, CodecError> {
    let mut args = Vec::new();
    while src.has_remaining() {
        args.push(codec::get_chunk2(src)?);
    }
    Ok(args)
}

impl Encodable for CallRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(self.flags);
        buf.put_u32(self.ttl);
        self.tracing.encode(buf)?;
        codec::put_str1(buf, &self.service, "service")?;
        encode_headers(&self.headers, buf)?;
        self.checksum.encode(buf)?;
        encode_args(&self.args, buf)
    }
}

impl Decodable for CallRequest {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<CallRequest, CodecError> {
        Ok(CallRequest {
            id: 0,
            flags: codec::get_u8(src)?,
            ttl: codec::get_u32(src)?,
            tracing: Tracing::decode(src)?,
            service: codec::get_str1(src, "service")?,
            headers: decode_headers(src)?,
            checksum: Checksum::decode(src)?,
            args: decode_args(src)?,
        })
    }
}

impl Encodable for CallResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(self.flags);
        buf.put_u8(self.code);
        self.tracing.encode(buf)?;
        encode_headers(&self.headers, buf)?;
        self.checksum.encode(buf)?;
        encode_args(&self.args, buf)
    }
}

impl Decodable for CallResponse {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<CallResponse, CodecError> {
        Ok(CallResponse {
            id: 0,
            flags: codec::get_u8(src)?,
            code: codec::get_u8(src)?,
            tracing: Tracing::decode(src)?,
            headers: decode_headers(src)?,
            checksum: Checksum::decode(src)?,
            args: decode_args(src)?,
        })
    }
}

impl Encodable for CallRequestContinue {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(self.flags);
        self.checksum.encode(buf)?;
        encode_args(&self.args, buf)
    }
}

impl Decodable for CallRequestContinue {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<CallRequestContinue, CodecError> {
        Ok(CallRequestContinue {
            id: 0,
            flags: codec::get_u8(src)?,
            checksum: Checksum::decode(src)?,
            args: decode_args(src)?,
        })
    }
}

impl Encodable for CallResponseContinue {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(self.flags);
        self.checksum.encode(buf)?;
        encode_args(&self.args, buf)
    }
}

impl Decodable for CallResponseContinue {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<CallResponseContinue, CodecError> {
        Ok(CallResponseContinue {
            id: 0,
            flags: codec::get_u8(src)?,
            checksum: Checksum::decode(src)?,
            args: decode_args(src)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::common::FLAG_FRAGMENT;

    fn sample_request() -> CallRequest {
        CallRequest {
            id: 0,
            flags: 0,
            ttl: 5000,
            tracing: Tracing::default(),
            service: "svc".to_string(),
            headers: HashMap::from([("as".to_string(), "raw".to_string())]),
            checksum: Checksum::None,
            args: vec![
                Bytes::from_static(b"endpoint"),
                Bytes::new(),
                Bytes::from_static(b"body"),
            ],
        }
    }

    #[test]
    fn call_request_roundtrip_test() {
        let request = sample_request();

        let payload = request.to_payload().unwrap();
        let mut src = Cursor::new(payload.as_ref());
        assert_eq!(CallRequest::decode(&mut src).unwrap(), request);
    }

    #[test]
    fn call_response_roundtrip_test() {
        let response = CallResponse {
            id: 0,
            flags: FLAG_FRAGMENT,
            code: 0,
            tracing: Tracing {
                span_id: 9,
                parent_id: 8,
                trace_id: 7,
                flags: 0,
            },
            headers: HashMap::new(),
            checksum: Checksum::Crc32(0x1234_5678),
            args: vec![Bytes::from_static(b"ok")],
        };

        let payload = response.to_payload().unwrap();
        let mut src = Cursor::new(payload.as_ref());
        assert_eq!(CallResponse::decode(&mut src).unwrap(), response);
    }

    #[test]
    fn continue_roundtrip_test() {
        let cont = CallRequestContinue {
            id: 0,
            flags: 0,
            checksum: Checksum::None,
            args: vec![Bytes::from_static(b"tail"), Bytes::new()],
        };

        let payload = cont.to_payload().unwrap();
        let mut src = Cursor::new(payload.as_ref());
        assert_eq!(CallRequestContinue::decode(&mut src).unwrap(), cont);
    }

    #[test]
    fn empty_args_preserved_test() {
        let mut request = sample_request();
        request.args = vec![Bytes::new(), Bytes::new(), Bytes::new()];

        let payload = request.to_payload().unwrap();
        let mut src = Cursor::new(payload.as_ref());
        let decoded = CallRequest::decode(&mut src).unwrap();
        assert_eq!(decoded.args, vec![Bytes::new(), Bytes::new(), Bytes::new()]);
    }
}
