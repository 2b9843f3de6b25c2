//! The message factory bridges logical calls and on-wire frames in both
//! directions: it splits an outgoing call whose arguments exceed a single
//! frame into a head message plus continuations, and it reassembles an
//! incoming chain back into one logical message.
//!
//! A frame boundary always falls inside the argument being written when the
//! frame filled up, so the first chunk of every continuation extends the last
//! argument accumulated so far. When an argument ends exactly at capacity
//! with more arguments behind it, the next frame opens with a zero-length
//! chunk that closes the split argument. Argument boundaries are therefore
//! exactly recoverable on the receiving side, empty arguments included.
//!
//! Every connection runs two factories, one per direction, so inbound-call
//! ids and outbound-call ids never collide in the reassembly table.

use crate::codec::CodecError;
use crate::errors::{Result, TChannelError};
use crate::frame::{FRAME_OVERHEAD, MAX_PAYLOAD_SIZE};
use crate::messages::common::FLAG_FRAGMENT;
use crate::messages::{CallRequestContinue, CallResponseContinue, Message, MessageType};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::mem;

/// Width of the length prefix in front of every argument chunk.
const ARG_PREFIX_WIDTH: usize = 2;

#[derive(Debug, Default)]
pub struct MessageFactory {
    /// Reassembly state: head message per id, accumulating arguments.
    pending: HashMap<u32, Message>,
}

impl MessageFactory {
    pub fn new() -> MessageFactory {
        MessageFactory {
            pending: HashMap::new(),
        }
    }

    /// Split an outgoing message into a chain of frame-sized messages.
    ///
    /// Non-call messages pass through untouched. Call messages come back as
    /// one head plus zero or more continuations, each guaranteed to encode
    /// under the u16 frame limit regardless of how large the logical message
    /// was. The caller's own fragment flag is preserved on the final piece,
    /// which is what lets the streaming layer chain several logical messages
    /// into one wire-level fragment run.
    pub fn fragment(&self, message: Message) -> Result<Vec<Message>> {
        match message.message_type() {
            MessageType::CallRequest
            | MessageType::CallResponse
            | MessageType::CallRequestContinue
            | MessageType::CallResponseContinue => self.fragment_call(message),
            _ => Ok(vec![message]),
        }
    }

    fn fragment_call(&self, mut head: Message) -> Result<Vec<Message>> {
        let final_flags = head.flags().unwrap_or(0);
        let mut queue: VecDeque<Bytes> =
            mem::take(head.args_mut().expect("call message has args")).into();

        let head_base = head.encode_payload()?.len();
        if head_base + ARG_PREFIX_WIDTH > MAX_PAYLOAD_SIZE {
            return Err(CodecError::FrameTooLarge(head_base + FRAME_OVERHEAD).into());
        }

        let template = empty_continuation(&head);
        let continue_base = template.encode_payload()?.len();

        let mut messages = Vec::new();
        let (chunks, mut more) = pack_args(&mut queue, MAX_PAYLOAD_SIZE - head_base);
        *head.args_mut().expect("call message has args") = chunks;
        head.set_flags(if more {
            final_flags | FLAG_FRAGMENT
        } else {
            final_flags
        });
        messages.push(head);

        while more {
            let (chunks, next) = pack_args(&mut queue, MAX_PAYLOAD_SIZE - continue_base);
            let mut continuation = template.clone();
            *continuation.args_mut().expect("continuation has args") = chunks;
            continuation.set_flags(if next {
                final_flags | FLAG_FRAGMENT
            } else {
                final_flags
            });
            messages.push(continuation);
            more = next;
        }
        Ok(messages)
    }

    /// Feed one incoming message through reassembly.
    ///
    /// Returns the complete logical message once the final fragment arrives,
    /// `None` while a chain is still open. A continuation with no open chain
    /// for its id is a protocol error; an ERROR frame aborts whatever chain
    /// its id had open and passes through.
    pub fn build(&mut self, mut message: Message) -> Result<Option<Message>> {
        match message.message_type() {
            MessageType::CallRequest | MessageType::CallResponse => {
                let id = message.id();
                if !message.is_fragment() {
                    return Ok(Some(message));
                }
                if self.pending.contains_key(&id) {
                    return Err(TChannelError::InvalidMessage(format!(
                        "call head for message {id} while a chain is already open"
                    )));
                }
                self.pending.insert(id, message);
                Ok(None)
            }
            MessageType::CallRequestContinue | MessageType::CallResponseContinue => {
                let id = message.id();
                let is_final = !message.is_fragment();
                let chunks = mem::take(message.args_mut().expect("continuation has args"));

                let pending = self.pending.get_mut(&id).ok_or_else(|| {
                    TChannelError::InvalidMessage(format!(
                        "continuation frame for message {id} with no call in progress"
                    ))
                })?;
                if pending.message_type().is_call_request()
                    != message.message_type().is_call_request()
                {
                    return Err(TChannelError::InvalidMessage(format!(
                        "continuation type mismatch for message {id}"
                    )));
                }

                let args = pending.args_mut().expect("call message has args");
                let mut chunks = chunks.into_iter();
                if let Some(first) = chunks.next() {
                    // the first chunk always extends the split argument
                    match args.last_mut() {
                        Some(last) => *last = concat(last, &first),
                        None => args.push(first),
                    }
                }
                args.extend(chunks);

                if is_final {
                    let mut complete = self.pending.remove(&id).expect("open chain");
                    let flags = complete.flags().unwrap_or(0);
                    complete.set_flags(flags & !FLAG_FRAGMENT);
                    Ok(Some(complete))
                } else {
                    Ok(None)
                }
            }
            MessageType::Error => {
                self.pending.remove(&message.id());
                Ok(Some(message))
            }
            _ => Ok(Some(message)),
        }
    }
}

fn empty_continuation(head: &Message) -> Message {
    let id = head.id();
    let checksum = head.checksum().unwrap_or_default();
    if head.message_type().is_call_request() {
        Message::CallRequestContinue(CallRequestContinue {
            id,
            flags: 0,
            checksum,
            args: Vec::new(),
        })
    } else {
        Message::CallResponseContinue(CallResponseContinue {
            id,
            flags: 0,
            checksum,
            args: Vec::new(),
        })
    }
}

/// Pack argument chunks into `space` bytes. Returns the chunks for this
/// frame and whether more frames are needed.
fn pack_args(queue: &mut VecDeque<Bytes>, mut space: usize) -> (Vec<Bytes>, bool) {
    let mut chunks = Vec::new();
    while let Some(mut arg) = queue.pop_front() {
        if space < ARG_PREFIX_WIDTH {
            // No room to even start this argument here. The next frame must
            // open with an empty chunk closing the argument emitted last,
            // otherwise the receiver would splice this one onto it.
            queue.push_front(arg);
            queue.push_front(Bytes::new());
            return (chunks, true);
        }
        let available = space - ARG_PREFIX_WIDTH;
        if arg.len() > available {
            let piece = arg.split_to(available);
            chunks.push(piece);
            queue.push_front(arg);
            return (chunks, true);
        }
        space -= ARG_PREFIX_WIDTH + arg.len();
        chunks.push(arg);
    }
    (chunks, false)
}

fn concat(left: &Bytes, right: &Bytes) -> Bytes {
    if left.is_empty() {
        return right.clone();
    }
    if right.is_empty() {
        return left.clone();
    }
    let mut joined = BytesMut::with_capacity(left.len() + right.len());
    joined.extend_from_slice(left);
    joined.extend_from_slice(right);
    joined.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::common::{Checksum, Tracing};
    use crate::messages::{CallRequest, ErrorCode, ErrorMessage, PingRequest};
    use std::collections::HashMap;

    fn request(id: u32, args: Vec<Bytes>) -> Message {
        Message::CallRequest(CallRequest {
            id,
            flags: 0,
            ttl: 1000,
            tracing: Tracing::default(),
            service: "svc".to_string(),
            headers: HashMap::new(),
            checksum: Checksum::None,
            args,
        })
    }

    /// Argument capacity of the head frame for `message`.
    fn head_capacity(message: &Message) -> usize {
        let mut empty = message.clone();
        empty.args_mut().unwrap().clear();
        MAX_PAYLOAD_SIZE - empty.encode_payload().unwrap().len() - ARG_PREFIX_WIDTH
    }

    #[test]
    fn non_call_messages_pass_through_test() {
        let factory = MessageFactory::new();
        let ping = Message::PingRequest(PingRequest { id: 5 });

        let fragments = factory.fragment(ping.clone()).unwrap();
        assert_eq!(fragments, vec![ping]);
    }

    #[test]
    fn small_call_is_one_frame_test() {
        let factory = MessageFactory::new();
        let message = request(
            1,
            vec![Bytes::from_static(b"ep"), Bytes::new(), Bytes::from_static(b"body")],
        );

        let fragments = factory.fragment(message.clone()).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(!fragments[0].is_fragment());
        assert_eq!(fragments[0], message);
    }

    #[test]
    fn exact_capacity_is_one_frame_test() {
        let probe = request(1, vec![]);
        let capacity = head_capacity(&probe);

        let factory = MessageFactory::new();
        let message = request(1, vec![Bytes::from(vec![0xAA; capacity])]);

        let fragments = factory.fragment(message).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(!fragments[0].is_fragment());
        assert_eq!(
            fragments[0].to_frame().unwrap().encode().unwrap().len(),
            crate::frame::MAX_FRAME_SIZE
        );
    }

    #[test]
    fn one_byte_over_capacity_is_two_frames_test() {
        let probe = request(1, vec![]);
        let capacity = head_capacity(&probe);

        let factory = MessageFactory::new();
        let message = request(1, vec![Bytes::from(vec![0xAA; capacity + 1])]);

        let fragments = factory.fragment(message).unwrap();
        assert_eq!(fragments.len(), 2);
        assert!(fragments[0].is_fragment());
        assert!(!fragments[1].is_fragment());
        assert_eq!(fragments[0].id(), fragments[1].id());

        let tail = fragments[1].args().unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].len(), 1);
    }

    #[test]
    fn arg_ending_at_capacity_opens_next_frame_with_empty_chunk_test() {
        let probe = request(1, vec![]);
        let capacity = head_capacity(&probe);

        let factory = MessageFactory::new();
        let message = request(
            1,
            vec![
                Bytes::from(vec![0xAA; capacity]),
                Bytes::from_static(b"second"),
            ],
        );

        let fragments = factory.fragment(message).unwrap();
        assert_eq!(fragments.len(), 2);
        let second = fragments[1].args().unwrap();
        assert_eq!(second[0], Bytes::new());
        assert_eq!(second[1], Bytes::from_static(b"second"));
    }

    #[test]
    fn fragment_then_reassemble_preserves_boundaries_test() {
        let factory = MessageFactory::new();
        let original = request(
            9,
            vec![
                Bytes::from(vec![0x01; 100_000]),
                Bytes::new(),
                Bytes::from(vec![0x02; 70_000]),
                Bytes::from_static(b"tail"),
            ],
        );

        let fragments = factory.fragment(original.clone()).unwrap();
        assert!(fragments.len() > 2);
        for fragment in &fragments {
            assert!(
                fragment.to_frame().unwrap().encode().unwrap().len()
                    <= crate::frame::MAX_FRAME_SIZE
            );
        }

        let mut receiver = MessageFactory::new();
        let mut complete = None;
        for (index, fragment) in fragments.iter().enumerate() {
            let result = receiver.build(fragment.clone()).unwrap();
            if index + 1 < fragments.len() {
                assert!(result.is_none());
            } else {
                complete = result;
            }
        }
        assert_eq!(complete.unwrap(), original);
    }

    #[test]
    fn continuation_without_open_chain_is_an_error_test() {
        let mut factory = MessageFactory::new();
        let orphan = Message::CallResponseContinue(CallResponseContinue {
            id: 77,
            flags: 0,
            checksum: Checksum::None,
            args: vec![Bytes::from_static(b"late")],
        });

        let result = factory.build(orphan);
        assert!(matches!(result, Err(TChannelError::InvalidMessage(_))));

        // other reassembly is not corrupted
        let fragments = factory
            .fragment(request(1, vec![Bytes::from(vec![0; 100_000])]))
            .unwrap();
        for fragment in &fragments[..fragments.len() - 1] {
            assert!(factory.build(fragment.clone()).unwrap().is_none());
        }
        assert!(
            factory
                .build(fragments.last().unwrap().clone())
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn duplicate_head_is_an_error_test() {
        let mut factory = MessageFactory::new();
        let mut head = request(3, vec![Bytes::from_static(b"x")]);
        head.set_flags(FLAG_FRAGMENT);

        assert!(factory.build(head.clone()).unwrap().is_none());
        assert!(matches!(
            factory.build(head),
            Err(TChannelError::InvalidMessage(_))
        ));
    }

    #[test]
    fn error_frame_aborts_open_chain_test() {
        let mut factory = MessageFactory::new();
        let mut head = request(3, vec![Bytes::from_static(b"x")]);
        head.set_flags(FLAG_FRAGMENT);
        assert!(factory.build(head).unwrap().is_none());

        let error = Message::Error(ErrorMessage {
            id: 3,
            code: ErrorCode::Cancelled,
            tracing: Tracing::default(),
            description: "gone".to_string(),
        });
        assert!(factory.build(error).unwrap().is_some());

        // the chain is gone; a further continuation is now orphaned
        let late = Message::CallRequestContinue(CallRequestContinue {
            id: 3,
            flags: 0,
            checksum: Checksum::None,
            args: vec![],
        });
        assert!(matches!(
            factory.build(late),
            Err(TChannelError::InvalidMessage(_))
        ));
    }
}
