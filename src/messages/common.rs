//! Constants and field types shared across message codecs.

use crate::codec::{self, CodecError, Decodable, Encodable};
use bytes::{BufMut, BytesMut};
use std::io::Cursor;

/// Protocol version carried in INIT messages.
pub const PROTOCOL_VERSION: u16 = 2;

/// Message ids wrap modulo this value; id 0 is reserved and never issued.
pub const MAX_MESSAGE_ID: u32 = u32::MAX;

/// Bit 0 of the call flags byte: more frames follow for this id.
pub const FLAG_FRAGMENT: u8 = 0x01;

/// Fixed width of an encoded [`Tracing`] block.
pub const TRACING_WIDTH: usize = 25;

/// Handshake header names the connection requires from its peer.
pub mod init_headers {
    pub const HOST_PORT: &str = "host_port";
    pub const PROCESS_NAME: &str = "process_name";
}

/// Distributed tracing span carried by calls and error frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tracing {
    pub span_id: u64,
    pub parent_id: u64,
    pub trace_id: u64,
    pub flags: u8,
}

impl Encodable for Tracing {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.span_id);
        buf.put_u64(self.parent_id);
        buf.put_u64(self.trace_id);
        buf.put_u8(self.flags);
        Ok(())
    }

    fn encoded_size(&self) -> usize {
        TRACING_WIDTH
    }
}

impl Decodable for Tracing {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<Tracing, CodecError> {
        Ok(Tracing {
            span_id: codec::get_u64(src)?,
            parent_id: codec::get_u64(src)?,
            trace_id: codec::get_u64(src)?,
            flags: codec::get_u8(src)?,
        })
    }
}

/// Checksum field of CALL frames. The core carries checksums opaquely; it
/// never computes or verifies them, that belongs to the per-message codec
/// collaborators riding above the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Checksum {
    #[default]
    None,
    Crc32(u32),
    Farmhash(u32),
    Crc32C(u32),
}

impl Checksum {
    pub fn type_byte(&self) -> u8 {
        match self {
            Checksum::None => 0x00,
            Checksum::Crc32(_) => 0x01,
            Checksum::Farmhash(_) => 0x02,
            Checksum::Crc32C(_) => 0x03,
        }
    }
}

impl Encodable for Checksum {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(self.type_byte());
        match self {
            Checksum::None => {}
            Checksum::Crc32(value) | Checksum::Farmhash(value) | Checksum::Crc32C(value) => {
                buf.put_u32(*value);
            }
        }
        Ok(())
    }
}

impl Decodable for Checksum {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<Checksum, CodecError> {
        match codec::get_u8(src)? {
            0x00 => Ok(Checksum::None),
            0x01 => Ok(Checksum::Crc32(codec::get_u32(src)?)),
            0x02 => Ok(Checksum::Farmhash(codec::get_u32(src)?)),
            0x03 => Ok(Checksum::Crc32C(codec::get_u32(src)?)),
            other => Err(CodecError::UnknownChecksumType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_roundtrip_test() {
        let tracing = Tracing {
            span_id: 1,
            parent_id: 2,
            trace_id: 3,
            flags: 1,
        };

        let payload = tracing.to_payload().unwrap();
        assert_eq!(payload.len(), TRACING_WIDTH);

        let mut src = Cursor::new(payload.as_ref());
        assert_eq!(Tracing::decode(&mut src).unwrap(), tracing);
    }

    #[test]
    fn checksum_roundtrip_test() {
        for checksum in [
            Checksum::None,
            Checksum::Crc32(0xDEAD_BEEF),
            Checksum::Farmhash(7),
            Checksum::Crc32C(0),
        ] {
            let payload = checksum.to_payload().unwrap();
            let mut src = Cursor::new(payload.as_ref());
            assert_eq!(Checksum::decode(&mut src).unwrap(), checksum);
        }
    }

    #[test]
    fn unknown_checksum_type_test() {
        let data: Vec<u8> = vec![0x09];
        let mut src = Cursor::new(data.as_slice());

        assert!(matches!(
            Checksum::decode(&mut src),
            Err(CodecError::UnknownChecksumType(0x09))
        ));
    }
}
