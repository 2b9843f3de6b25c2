//! Hook points the connection fires into as traffic flows.
//!
//! The connection holds a non-owning reference to one sink; the default sink
//! ignores everything. Implementations must not block: events fire from the
//! dispatch loop and the send paths.

use crate::errors::TChannelError;
use crate::messages::ErrorMessage;
use crate::streaming::OutgoingResponse;

pub trait EventSink: Send + Sync {
    /// An ERROR frame we produced has been written to the wire.
    fn after_send_error(&self, _error: &ErrorMessage) {}

    /// The peer reported an error for a call that no longer has an active
    /// waiter.
    fn after_receive_error(&self, _error: &TChannelError) {}

    /// A streamed response has been fully written to the wire.
    fn after_send_response(&self, _response: &OutgoingResponse) {}
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {}
