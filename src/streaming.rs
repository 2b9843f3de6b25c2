//! Streaming calls: requests and responses whose arguments are produced
//! incrementally rather than known up front.
//!
//! Each argument is an [`ArgStream`] of byte chunks. The connection reads one
//! chunk per argument in order; while an argument keeps yielding chunks, each
//! full buffer is flushed as a fragment and a new message begins. Once every
//! argument drains, a final message goes out with the fragment flag cleared.
//! The receiving side sees a single logical call either way.

use crate::connection::{Connection, ResponseFuture};
use crate::errors::{Result, TChannelError};
use crate::messages::common::{Checksum, FLAG_FRAGMENT, Tracing};
use crate::messages::{
    CallRequest, CallRequestContinue, CallResponse, CallResponseContinue, Message,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::mem;
use std::time::Duration;
use tokio::sync::mpsc;

const ARG_CHANNEL_CAPACITY: usize = 16;

/// Producing half of an argument stream. Dropping the writer finishes the
/// argument.
pub struct ArgWriter {
    tx: mpsc::Sender<Bytes>,
}

impl ArgWriter {
    /// Append a chunk to the argument. Suspends while the connection is
    /// behind on draining earlier chunks.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(chunk.into())
            .await
            .map_err(|_| TChannelError::Network("argument stream closed".to_string()))
    }
}

/// One argument of a streamed call, yielded as an ordered sequence of byte
/// chunks.
pub struct ArgStream {
    rx: mpsc::Receiver<Bytes>,
}

impl ArgStream {
    /// An argument fed incrementally through the returned writer.
    pub fn channel() -> (ArgWriter, ArgStream) {
        let (tx, rx) = mpsc::channel(ARG_CHANNEL_CAPACITY);
        (ArgWriter { tx }, ArgStream { rx })
    }

    /// An argument whose full contents are already known.
    pub fn from_bytes(data: impl Into<Bytes>) -> ArgStream {
        Self::from_chunks(vec![data.into()])
    }

    /// An argument made of the given chunks, already complete.
    pub fn from_chunks(chunks: Vec<Bytes>) -> ArgStream {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            // capacity matches the chunk count, so this cannot fail
            let _ = tx.try_send(chunk);
        }
        ArgStream { rx }
    }

    /// Next chunk, or `None` once the argument is complete.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Stop accepting further chunks from the producer.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// An outgoing call with streamed arguments.
pub struct OutgoingRequest {
    pub id: u32,
    pub service: String,
    pub headers: HashMap<String, String>,
    pub ttl: Option<Duration>,
    pub tracing: Tracing,
    pub arg_streams: Vec<ArgStream>,
}

impl OutgoingRequest {
    pub fn new(service: impl Into<String>) -> OutgoingRequest {
        OutgoingRequest {
            id: 0,
            service: service.into(),
            headers: HashMap::new(),
            ttl: None,
            tracing: Tracing::default(),
            arg_streams: Vec::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_arg(mut self, stream: ArgStream) -> Self {
        self.arg_streams.push(stream);
        self
    }

    fn ttl_millis(&self) -> u32 {
        self.ttl
            .map(|ttl| ttl.as_millis().min(u32::MAX as u128) as u32)
            .unwrap_or(0)
    }

    fn close_arg_streams(streams: &mut [ArgStream]) {
        for stream in streams {
            stream.close();
        }
    }
}

/// An outgoing response with streamed arguments. Its id must match the call
/// being answered.
pub struct OutgoingResponse {
    pub id: u32,
    pub code: u8,
    pub headers: HashMap<String, String>,
    pub tracing: Tracing,
    pub arg_streams: Vec<ArgStream>,
}

impl OutgoingResponse {
    pub fn new(id: u32) -> OutgoingResponse {
        OutgoingResponse {
            id,
            code: 0,
            headers: HashMap::new(),
            tracing: Tracing::default(),
            arg_streams: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: u8) -> Self {
        self.code = code;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_arg(mut self, stream: ArgStream) -> Self {
        self.arg_streams.push(stream);
        self
    }
}

enum StreamHead<'a> {
    Request(&'a OutgoingRequest),
    Response(&'a OutgoingResponse),
}

impl StreamHead<'_> {
    fn build(&self, args: Vec<Bytes>, first: bool, more: bool) -> Message {
        let flags = if more { FLAG_FRAGMENT } else { 0 };
        match self {
            StreamHead::Request(request) => {
                if first {
                    Message::CallRequest(CallRequest {
                        id: request.id,
                        flags,
                        ttl: request.ttl_millis(),
                        tracing: request.tracing,
                        service: request.service.clone(),
                        headers: request.headers.clone(),
                        checksum: Checksum::None,
                        args,
                    })
                } else {
                    Message::CallRequestContinue(CallRequestContinue {
                        id: request.id,
                        flags,
                        checksum: Checksum::None,
                        args,
                    })
                }
            }
            StreamHead::Response(response) => {
                if first {
                    Message::CallResponse(CallResponse {
                        id: response.id,
                        flags,
                        code: response.code,
                        tracing: response.tracing,
                        headers: response.headers.clone(),
                        checksum: Checksum::None,
                        args,
                    })
                } else {
                    Message::CallResponseContinue(CallResponseContinue {
                        id: response.id,
                        flags,
                        checksum: Checksum::None,
                        args,
                    })
                }
            }
        }
    }
}

impl Connection {
    /// Stream a request and register a slot for its response.
    ///
    /// If the request carries a ttl, a timeout is armed that fails the slot
    /// and tombstones the id when it fires first; completion first cancels
    /// it. Streaming failures are delivered through the returned slot.
    pub async fn send_request(&self, mut request: OutgoingRequest) -> ResponseFuture {
        assert!(self.inner.is_dispatching(), "perform a handshake first");

        if request.id == 0 {
            request.id = self.inner.writer.next_id();
        }
        let id = request.id;
        let rx = self.inner.register_slot(id);

        if let Some(ttl) = request.ttl {
            self.inner.spawn_timeout(id, ttl);
        }

        let mut streams = mem::take(&mut request.arg_streams);
        let result = self
            .stream_out(StreamHead::Request(&request), &mut streams)
            .await;
        OutgoingRequest::close_arg_streams(&mut streams);

        if let Err(err) = result {
            self.inner.fail_slot(id, err);
        }
        ResponseFuture::new(rx)
    }

    /// Stream a request without expecting a response.
    pub async fn stream_request(&self, mut request: OutgoingRequest) -> Result<()> {
        if request.id == 0 {
            request.id = self.inner.writer.next_id();
        }
        let mut streams = mem::take(&mut request.arg_streams);
        let result = self
            .stream_out(StreamHead::Request(&request), &mut streams)
            .await;
        OutgoingRequest::close_arg_streams(&mut streams);
        result
    }

    /// Stream a response out fragment by fragment; fires
    /// `after_send_response` on completion. Argument streams are closed
    /// regardless of outcome.
    pub async fn post_response(&self, mut response: OutgoingResponse) -> Result<()> {
        let mut streams = mem::take(&mut response.arg_streams);
        let result = self
            .stream_out(StreamHead::Response(&response), &mut streams)
            .await;
        OutgoingRequest::close_arg_streams(&mut streams);

        if result.is_ok() {
            self.inner.events.after_send_response(&response);
        }
        result
    }

    /// Read one chunk per argument in order, flushing a fragment whenever an
    /// argument yields more chunks, then emit the final message with the
    /// fragment flag cleared. Frame-size limits are enforced downstream by
    /// the message factory, so oversized buffers here are still safe.
    async fn stream_out(&self, head: StreamHead<'_>, streams: &mut [ArgStream]) -> Result<()> {
        let mut args: Vec<Bytes> = Vec::new();
        let mut first = true;

        for stream in streams.iter_mut() {
            let chunk = stream.next_chunk().await.unwrap_or_default();
            args.push(chunk);

            while let Some(chunk) = stream.next_chunk().await {
                let message = head.build(mem::take(&mut args), first, true);
                self.write(message)?.await?;
                first = false;
                args = vec![chunk];
            }
        }

        let message = head.build(args, first, false);
        self.write(message)?.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_chunks_yields_in_order_test() {
        let mut stream = ArgStream::from_chunks(vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
        ]);

        assert_eq!(stream.next_chunk().await, Some(Bytes::from_static(b"one")));
        assert_eq!(stream.next_chunk().await, Some(Bytes::from_static(b"two")));
        assert_eq!(stream.next_chunk().await, None);
    }

    #[tokio::test]
    async fn writer_feeds_stream_test() {
        let (writer, mut stream) = ArgStream::channel();

        writer.write("chunk").await.unwrap();
        drop(writer);

        assert_eq!(stream.next_chunk().await, Some(Bytes::from_static(b"chunk")));
        assert_eq!(stream.next_chunk().await, None);
    }

    #[test]
    fn ttl_is_carried_in_milliseconds_test() {
        let request = OutgoingRequest::new("svc").with_ttl(Duration::from_millis(50));
        assert_eq!(request.ttl_millis(), 50);

        let unbounded = OutgoingRequest::new("svc");
        assert_eq!(unbounded.ttl_millis(), 0);
    }
}
