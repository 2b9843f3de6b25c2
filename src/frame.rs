//! The on-wire frame: the smallest unit the transport deals in.
//!
//! Every frame is `size:u16 || type:u8 || id:u32 || payload`, where `size`
//! counts the whole frame including the size field itself. The size prefix
//! caps a frame at 64KB; large logical messages are split into several frames
//! by the message factory before they reach this layer.

use crate::codec::{self, CodecError};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Width of the size prefix.
pub const SIZE_WIDTH: usize = 2;

/// Fixed overhead of a frame: size prefix, message type, and message id.
pub const FRAME_OVERHEAD: usize = SIZE_WIDTH + 1 + 4;

/// Largest frame the size prefix can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_OVERHEAD;

/// A single size-prefixed frame. The message type and id are opaque at this
/// level; the message layer interprets them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u8,
    pub id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: u8, id: u32, payload: Bytes) -> Frame {
        Frame {
            message_type,
            id,
            payload,
        }
    }

    /// Total on-wire size of this frame, including the size prefix.
    pub fn size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Encode the frame into its wire representation. Fails if the total
    /// length does not fit the u16 size prefix.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let size = self.size();
        if size > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(size));
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u16(size as u16);
        buf.put_u8(self.message_type);
        buf.put_u32(self.id);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode the size prefix alone. The caller can then wait until `size`
    /// bytes are available before decoding the rest.
    pub fn decode_size(src: &mut Cursor<&[u8]>) -> Result<usize, CodecError> {
        Ok(codec::get_u16(src)? as usize)
    }

    /// Decode a complete frame, size prefix included.
    pub fn decode(src: &mut Cursor<&[u8]>) -> Result<Frame, CodecError> {
        let size = Self::decode_size(src)?;
        if size < FRAME_OVERHEAD {
            return Err(CodecError::FrameTooSmall(size));
        }

        let message_type = codec::get_u8(src)?;
        let id = codec::get_u32(src)?;
        let payload = codec::get_bytes(src, size - FRAME_OVERHEAD)?;
        Ok(Frame {
            message_type,
            id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip_test() {
        let frame = Frame::new(0x03, 42, Bytes::from_static(b"hello"));

        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), FRAME_OVERHEAD + 5);
        assert_eq!(&encoded[..2], &[0x00, 0x0C]);

        let mut src = Cursor::new(encoded.as_ref());
        let decoded = Frame::decode(&mut src).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_payload_roundtrip_test() {
        let frame = Frame::new(0xD0, 1, Bytes::new());

        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), FRAME_OVERHEAD);

        let mut src = Cursor::new(encoded.as_ref());
        assert_eq!(Frame::decode(&mut src).unwrap(), frame);
    }

    #[test]
    fn max_payload_fits_test() {
        let frame = Frame::new(0x03, 7, Bytes::from(vec![0xAB; MAX_PAYLOAD_SIZE]));

        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn oversized_frame_rejected_test() {
        let frame = Frame::new(0x03, 7, Bytes::from(vec![0xAB; MAX_PAYLOAD_SIZE + 1]));

        assert!(matches!(
            frame.encode(),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn undersized_frame_rejected_test() {
        // size prefix claims 6 bytes, below the fixed header width
        let data: Vec<u8> = vec![0x00, 0x06, 0x03, 0x00, 0x00, 0x00];
        let mut src = Cursor::new(data.as_slice());

        assert!(matches!(
            Frame::decode(&mut src),
            Err(CodecError::FrameTooSmall(6))
        ));
    }

    #[test]
    fn incomplete_frame_test() {
        let frame = Frame::new(0x03, 42, Bytes::from_static(b"hello"));
        let encoded = frame.encode().unwrap();

        let mut src = Cursor::new(&encoded.as_ref()[..encoded.len() - 1]);
        assert!(matches!(
            Frame::decode(&mut src),
            Err(CodecError::Incomplete)
        ));
    }
}
