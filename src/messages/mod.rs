//! Decoded protocol messages and the type registry that maps frame
//! discriminants onto their codecs.

pub mod call;
pub mod common;
pub mod error;
pub mod init;
pub mod ping;

pub use call::{CallRequest, CallRequestContinue, CallResponse, CallResponseContinue};
pub use common::{
    Checksum, FLAG_FRAGMENT, MAX_MESSAGE_ID, PROTOCOL_VERSION, Tracing, init_headers,
};
pub use error::{ErrorCode, ErrorMessage};
pub use init::{InitRequest, InitResponse};
pub use ping::{PingRequest, PingResponse};

use crate::codec::{CodecError, Decodable, Encodable};
use crate::frame::Frame;
use bytes::Bytes;
use num_enum::TryFromPrimitive;
use std::io::Cursor;

/// Message type discriminants as they appear on the wire.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    InitRequest = 0x01,
    InitResponse = 0x02,
    CallRequest = 0x03,
    CallResponse = 0x04,
    CallRequestContinue = 0x13,
    CallResponseContinue = 0x14,
    PingRequest = 0xD0,
    PingResponse = 0xD1,
    Error = 0xFF,
}

impl MessageType {
    /// True for CALL_REQ and CALL_REQ_CONTINUE.
    pub fn is_call_request(self) -> bool {
        matches!(
            self,
            MessageType::CallRequest | MessageType::CallRequestContinue
        )
    }

    /// True for CALL_RES and CALL_RES_CONTINUE.
    pub fn is_call_response(self) -> bool {
        matches!(
            self,
            MessageType::CallResponse | MessageType::CallResponseContinue
        )
    }
}

/// A decoded logical message, identified by id.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    InitRequest(InitRequest),
    InitResponse(InitResponse),
    CallRequest(CallRequest),
    CallRequestContinue(CallRequestContinue),
    CallResponse(CallResponse),
    CallResponseContinue(CallResponseContinue),
    Error(ErrorMessage),
    PingRequest(PingRequest),
    PingResponse(PingResponse),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::InitRequest(_) => MessageType::InitRequest,
            Message::InitResponse(_) => MessageType::InitResponse,
            Message::CallRequest(_) => MessageType::CallRequest,
            Message::CallRequestContinue(_) => MessageType::CallRequestContinue,
            Message::CallResponse(_) => MessageType::CallResponse,
            Message::CallResponseContinue(_) => MessageType::CallResponseContinue,
            Message::Error(_) => MessageType::Error,
            Message::PingRequest(_) => MessageType::PingRequest,
            Message::PingResponse(_) => MessageType::PingResponse,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Message::InitRequest(m) => m.id,
            Message::InitResponse(m) => m.id,
            Message::CallRequest(m) => m.id,
            Message::CallRequestContinue(m) => m.id,
            Message::CallResponse(m) => m.id,
            Message::CallResponseContinue(m) => m.id,
            Message::Error(m) => m.id,
            Message::PingRequest(m) => m.id,
            Message::PingResponse(m) => m.id,
        }
    }

    pub fn set_id(&mut self, id: u32) {
        match self {
            Message::InitRequest(m) => m.id = id,
            Message::InitResponse(m) => m.id = id,
            Message::CallRequest(m) => m.id = id,
            Message::CallRequestContinue(m) => m.id = id,
            Message::CallResponse(m) => m.id = id,
            Message::CallResponseContinue(m) => m.id = id,
            Message::Error(m) => m.id = id,
            Message::PingRequest(m) => m.id = id,
            Message::PingResponse(m) => m.id = id,
        }
    }

    /// Flags byte of CALL messages; `None` for everything else.
    pub fn flags(&self) -> Option<u8> {
        match self {
            Message::CallRequest(m) => Some(m.flags),
            Message::CallRequestContinue(m) => Some(m.flags),
            Message::CallResponse(m) => Some(m.flags),
            Message::CallResponseContinue(m) => Some(m.flags),
            _ => None,
        }
    }

    pub(crate) fn set_flags(&mut self, flags: u8) {
        match self {
            Message::CallRequest(m) => m.flags = flags,
            Message::CallRequestContinue(m) => m.flags = flags,
            Message::CallResponse(m) => m.flags = flags,
            Message::CallResponseContinue(m) => m.flags = flags,
            _ => {}
        }
    }

    /// True if this is a CALL message announcing further fragments.
    pub fn is_fragment(&self) -> bool {
        self.flags()
            .is_some_and(|flags| flags & FLAG_FRAGMENT != 0)
    }

    /// Argument chunks of CALL messages; `None` for everything else.
    pub fn args(&self) -> Option<&Vec<Bytes>> {
        match self {
            Message::CallRequest(m) => Some(&m.args),
            Message::CallRequestContinue(m) => Some(&m.args),
            Message::CallResponse(m) => Some(&m.args),
            Message::CallResponseContinue(m) => Some(&m.args),
            _ => None,
        }
    }

    pub(crate) fn args_mut(&mut self) -> Option<&mut Vec<Bytes>> {
        match self {
            Message::CallRequest(m) => Some(&mut m.args),
            Message::CallRequestContinue(m) => Some(&mut m.args),
            Message::CallResponse(m) => Some(&mut m.args),
            Message::CallResponseContinue(m) => Some(&mut m.args),
            _ => None,
        }
    }

    pub(crate) fn checksum(&self) -> Option<Checksum> {
        match self {
            Message::CallRequest(m) => Some(m.checksum),
            Message::CallRequestContinue(m) => Some(m.checksum),
            Message::CallResponse(m) => Some(m.checksum),
            Message::CallResponseContinue(m) => Some(m.checksum),
            _ => None,
        }
    }

    /// Decode a frame into a message, dispatching on the type discriminant
    /// and attaching the frame id.
    pub fn decode(frame: &Frame) -> Result<Message, CodecError> {
        let message_type = MessageType::try_from(frame.message_type)
            .map_err(|_| CodecError::UnknownMessageType(frame.message_type))?;

        let mut src = Cursor::new(frame.payload.as_ref());
        let mut message = match message_type {
            MessageType::InitRequest => Message::InitRequest(InitRequest::decode(&mut src)?),
            MessageType::InitResponse => Message::InitResponse(InitResponse::decode(&mut src)?),
            MessageType::CallRequest => Message::CallRequest(CallRequest::decode(&mut src)?),
            MessageType::CallRequestContinue => {
                Message::CallRequestContinue(CallRequestContinue::decode(&mut src)?)
            }
            MessageType::CallResponse => Message::CallResponse(CallResponse::decode(&mut src)?),
            MessageType::CallResponseContinue => {
                Message::CallResponseContinue(CallResponseContinue::decode(&mut src)?)
            }
            MessageType::Error => Message::Error(ErrorMessage::decode(&mut src)?),
            MessageType::PingRequest => Message::PingRequest(PingRequest::decode(&mut src)?),
            MessageType::PingResponse => Message::PingResponse(PingResponse::decode(&mut src)?),
        };
        message.set_id(frame.id);
        Ok(message)
    }

    /// Encode this message into a frame carrying its id and discriminant.
    pub fn to_frame(&self) -> Result<Frame, CodecError> {
        let payload = self.encode_payload()?;
        Ok(Frame::new(self.message_type() as u8, self.id(), payload))
    }

    pub fn encode_payload(&self) -> Result<Bytes, CodecError> {
        match self {
            Message::InitRequest(m) => m.to_payload(),
            Message::InitResponse(m) => m.to_payload(),
            Message::CallRequest(m) => m.to_payload(),
            Message::CallRequestContinue(m) => m.to_payload(),
            Message::CallResponse(m) => m.to_payload(),
            Message::CallResponseContinue(m) => m.to_payload(),
            Message::Error(m) => m.to_payload(),
            Message::PingRequest(m) => m.to_payload(),
            Message::PingResponse(m) => m.to_payload(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn frame_message_roundtrip_test() {
        let message = Message::CallRequest(CallRequest {
            id: 99,
            flags: 0,
            ttl: 1000,
            tracing: Tracing::default(),
            service: "svc".to_string(),
            headers: HashMap::new(),
            checksum: Checksum::None,
            args: vec![Bytes::from_static(b"ep"), Bytes::from_static(b"body")],
        });

        let frame = message.to_frame().unwrap();
        assert_eq!(frame.message_type, 0x03);
        assert_eq!(frame.id, 99);

        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.id(), 99);
    }

    #[test]
    fn unknown_message_type_test() {
        let frame = Frame::new(0x77, 1, Bytes::new());

        assert!(matches!(
            Message::decode(&frame),
            Err(CodecError::UnknownMessageType(0x77))
        ));
    }

    #[test]
    fn call_type_categories_test() {
        assert!(MessageType::CallRequest.is_call_request());
        assert!(MessageType::CallRequestContinue.is_call_request());
        assert!(!MessageType::CallResponse.is_call_request());
        assert!(MessageType::CallResponse.is_call_response());
        assert!(MessageType::CallResponseContinue.is_call_response());
        assert!(!MessageType::PingRequest.is_call_response());
    }

    #[test]
    fn fragment_flag_test() {
        let mut message = Message::CallRequestContinue(CallRequestContinue::default());
        assert!(!message.is_fragment());

        message.set_flags(FLAG_FRAGMENT);
        assert!(message.is_fragment());

        let ping = Message::PingRequest(PingRequest { id: 1 });
        assert!(!ping.is_fragment());
    }
}
