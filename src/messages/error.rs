//! The ERROR frame: `code:u1 tracing:25 message~2`.

use crate::codec::{self, CodecError, Decodable, Encodable};
use crate::messages::common::Tracing;
use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::Cursor;

/// Error codes a peer can report.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The request exceeded its ttl on the remote side.
    Timeout = 0x01,
    /// The request was cancelled.
    Cancelled = 0x02,
    /// The peer is overloaded; try another one.
    Busy = 0x03,
    /// The peer declined to process the request.
    Declined = 0x04,
    /// The handler failed unexpectedly.
    UnexpectedError = 0x05,
    /// The request was malformed at the application level.
    BadRequest = 0x06,
    /// The peer failed to reach a downstream node.
    NetworkError = 0x07,
    /// The peer reports itself unhealthy.
    Unhealthy = 0x08,
    /// The frame violated the protocol; the connection must close.
    FatalProtocolError = 0xFF,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ErrorMessage {
    pub id: u32,
    pub code: ErrorCode,
    pub tracing: Tracing,
    pub description: String,
}

impl Encodable for ErrorMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(self.code as u8);
        self.tracing.encode(buf)?;
        codec::put_str2(buf, &self.description, "description")
    }
}

impl Decodable for ErrorMessage {
    fn decode(src: &mut Cursor<&[u8]>) -> Result<ErrorMessage, CodecError> {
        let raw = codec::get_u8(src)?;
        let code = ErrorCode::try_from(raw).map_err(|_| CodecError::UnknownErrorCode(raw))?;
        Ok(ErrorMessage {
            id: 0,
            code,
            tracing: Tracing::decode(src)?,
            description: codec::get_str2(src, "description")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_roundtrip_test() {
        let message = ErrorMessage {
            id: 0,
            code: ErrorCode::Busy,
            tracing: Tracing::default(),
            description: "too many requests".to_string(),
        };

        let payload = message.to_payload().unwrap();
        let mut src = Cursor::new(payload.as_ref());
        assert_eq!(ErrorMessage::decode(&mut src).unwrap(), message);
    }

    #[test]
    fn unknown_error_code_test() {
        let mut data = vec![0x42];
        data.extend_from_slice(&[0u8; 25]);
        data.extend_from_slice(&[0x00, 0x00]);

        let mut src = Cursor::new(data.as_slice());
        assert!(matches!(
            ErrorMessage::decode(&mut src),
            Err(CodecError::UnknownErrorCode(0x42))
        ));
    }
}
