//! Per-peer TChannel connection engine.
//!
//! A [`Connection`] carries many concurrent logical calls over a single
//! ordered byte stream, multiplexed by message id. Large calls are split
//! into bounded frames on the way out and reassembled on receipt; responses
//! are correlated with outstanding requests by id; per-call deadlines fail
//! the waiting slot and leave a short-lived tombstone so that late responses
//! are silently dropped; and a disconnect cleanly fails everything that was
//! still in flight.
//!
//! The wire codec for each message type lives under [`messages`], the frame
//! layer in [`frame`], fragmentation and reassembly in [`fragment`], and the
//! connection state machine itself in [`connection`].
//!
//! # Example
//!
//! Connect somewhere, perform the handshake, and make a call:
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use tchannel::messages::CallRequest;
//! use tchannel::{Connection, ConnectionOptions, Message};
//!
//! #[tokio::main]
//! async fn main() -> tchannel::Result<()> {
//!     let connection = Connection::outgoing(
//!         "127.0.0.1:4040",
//!         ConnectionOptions::new().with_process_name("example"),
//!     )
//!     .await?;
//!
//!     let response = connection
//!         .send(Message::CallRequest(CallRequest {
//!             service: "echo".to_string(),
//!             args: vec![Bytes::from_static(b"ping"), Bytes::new(), Bytes::new()],
//!             ..CallRequest::default()
//!         }))
//!         .await?;
//!     println!("got {:?}", response.message_type());
//!
//!     connection.close();
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod errors;
pub mod events;
pub mod fragment;
pub mod frame;
pub mod messages;
pub mod streaming;
pub mod tombstone;


pub use codec::{CodecError, Decodable, Encodable};
pub use connection::{
    Connection, ConnectionOptions, Direction, PeerInfo, ResponseFuture, WriteFuture,
};
pub use errors::{Result, TChannelError};
pub use events::{EventSink, NullEventSink};
pub use messages::{Message, MessageType};
pub use streaming::{ArgStream, ArgWriter, OutgoingRequest, OutgoingResponse};
