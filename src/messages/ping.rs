//! PING_REQ / PING_RES. Both have empty payloads; the id does all the work.

use crate::codec::{CodecError, Decodable, Encodable};
use bytes::{Buf, BytesMut};
use std::io::Cursor;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PingRequest {
    pub id: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PingResponse {
    pub id: u32,
}

impl Encodable for PingRequest {
    fn encode(&self, _buf: &mut BytesMut) -> Result<(), CodecError> {
        Ok(())
    }
}

impl Decodable for PingRequest {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<PingRequest, CodecError> {
        if src.has_remaining() {
            return Err(CodecError::TrailingBytes("PING_REQ"));
        }
        Ok(PingRequest { id: 0 })
    }
}

impl Encodable for PingResponse {
    fn encode(&self, _buf: &mut BytesMut) -> Result<(), CodecError> {
        Ok(())
    }
}

impl Decodable for PingResponse {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<PingResponse, CodecError> {
        if src.has_remaining() {
            return Err(CodecError::TrailingBytes("PING_RES"));
        }
        Ok(PingResponse { id: 0 })
    }
}
