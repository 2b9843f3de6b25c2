//! INIT_REQ / INIT_RES: the handshake exchange that precedes all other
//! traffic.
//!
//! Both carry `version:u16 || nh:u16 || (key~2 value~2)*`. The connection
//! requires the `host_port` and `process_name` headers; anything else rides
//! along untouched.

use crate::codec::{self, CodecError, Decodable, Encodable};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::io::Cursor;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InitRequest {
    pub id: u32,
    pub version: u16,
    pub headers: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InitResponse {
    pub id: u32,
    pub version: u16,
    pub headers: HashMap<String, String>,
}

// Headers are written in sorted key order so the encoding is deterministic.
fn encode_init_body(
    version: u16,
    headers: &HashMap<String, String>,
    buf: &mut BytesMut,
) -> Result<(), CodecError> {
    buf.put_u16(version);

    if headers.len() > u16::MAX as usize {
        return Err(CodecError::FieldTooLong {
            field: "headers",
            len: headers.len(),
        });
    }
    buf.put_u16(headers.len() as u16);

    let mut keys: Vec<&String> = headers.keys().collect();
    keys.sort();
    for key in keys {
        codec::put_str2(buf, key, "header_key")?;
        codec::put_str2(buf, &headers[key], "header_value")?;
    }
    Ok(())
}

fn decode_init_body(
    src: &mut Cursor<&[u8]>,
) -> Result<(u16, HashMap<String, String>), CodecError> {
    let version = codec::get_u16(src)?;
    let count = codec::get_u16(src)? as usize;

    let mut headers = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = codec::get_str2(src, "header_key")?;
        let value = codec::get_str2(src, "header_value")?;
        headers.insert(key, value);
    }
    Ok((version, headers))
}

impl Encodable for InitRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_init_body(self.version, &self.headers, buf)
    }
}

impl Decodable for InitRequest {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<InitRequest, CodecError> {
        let (version, headers) = decode_init_body(src)?;
        Ok(InitRequest {
            id: 0,
            version,
            headers,
        })
    }
}

impl Encodable for InitResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        encode_init_body(self.version, &self.headers, buf)
    }
}

impl Decodable for InitResponse {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<InitResponse, CodecError> {
        let (version, headers) = decode_init_body(src)?;
        Ok(InitResponse {
            id: 0,
            version,
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::common::PROTOCOL_VERSION;

    #[test]
    fn init_request_roundtrip_test() {
        let request = InitRequest {
            id: 0,
            version: PROTOCOL_VERSION,
            headers: HashMap::from([
                ("host_port".to_string(), "127.0.0.1:4040".to_string()),
                ("process_name".to_string(), "q".to_string()),
            ]),
        };

        let payload = request.to_payload().unwrap();
        let mut src = Cursor::new(payload.as_ref());
        assert_eq!(InitRequest::decode(&mut src).unwrap(), request);
    }

    #[test]
    fn init_response_empty_headers_test() {
        let response = InitResponse {
            id: 0,
            version: PROTOCOL_VERSION,
            headers: HashMap::new(),
        };

        let payload = response.to_payload().unwrap();
        // version + header count, nothing else
        assert_eq!(payload.len(), 4);

        let mut src = Cursor::new(payload.as_ref());
        assert_eq!(InitResponse::decode(&mut src).unwrap(), response);
    }

    #[test]
    fn init_request_encoding_is_sorted_test() {
        let request = InitRequest {
            id: 0,
            version: PROTOCOL_VERSION,
            headers: HashMap::from([
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
            ]),
        };

        let payload = request.to_payload().unwrap();
        // version || nh || "a"~2 "1"~2 || "b"~2 "2"~2
        assert_eq!(
            payload.as_ref(),
            &[
                0x00, 0x02, 0x00, 0x02, 0x00, 0x01, b'a', 0x00, 0x01, b'1', 0x00, 0x01, b'b',
                0x00, 0x01, b'2'
            ]
        );
    }
}
