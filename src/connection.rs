//! Manages a bi-directional conversation between two peers over one ordered
//! byte stream.
//!
//! A connection multiplexes many concurrent logical calls by message id. The
//! primary operations are:
//!
//! - [`Connection::write`]: send a message up the wire.
//! - [`Connection::send`]: send a call and get a slot for its response.
//! - [`Connection::next_call`]: receive the next incoming call.
//!
//! Depending on the direction of the connection, one of
//! [`Connection::initiate_handshake`] or [`Connection::expect_handshake`]
//! must complete before any of the above are used. The handshake starts the
//! dispatch loop, which routes every incoming message to the inbound-call
//! queue, to the response slot registered under its id, or to the floor.
//!
//! The underlying stream is owned by two background tasks: a fill task that
//! is the only reader, and a drain task that is the only writer. Frames
//! reach the wire in exactly the order they were submitted.

use crate::codec::CodecError;
use crate::errors::{Result, TChannelError};
use crate::events::{EventSink, NullEventSink};
use crate::fragment::MessageFactory;
use crate::frame::{FRAME_OVERHEAD, Frame, SIZE_WIDTH};
use crate::messages::common::{MAX_MESSAGE_ID, PROTOCOL_VERSION, Tracing, init_headers};
use crate::messages::{
    ErrorCode, ErrorMessage, InitRequest, InitResponse, Message, PingRequest, PingResponse,
};
use crate::tombstone::Tombstones;
use std::collections::HashMap;
use std::future::Future;
use std::io::{self, Cursor};
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tracing::{debug, error, warn};

/// Which side opened the underlying stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// What we learned about the peer during the handshake.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub host: String,
    pub port: u16,
    pub process_name: Option<String>,
    /// Protocol version the peer requested. Recorded, not negotiated.
    pub version: u16,
}

impl Default for PeerInfo {
    fn default() -> PeerInfo {
        PeerInfo {
            host: "0.0.0.0".to_string(),
            port: 0,
            process_name: None,
            version: PROTOCOL_VERSION,
        }
    }
}

/// Handshake identity advertised to the peer, plus the event sink wiring.
#[derive(Clone)]
pub struct ConnectionOptions {
    host_port: String,
    process_name: String,
    headers: HashMap<String, String>,
    events: Arc<dyn EventSink>,
}

impl Default for ConnectionOptions {
    fn default() -> ConnectionOptions {
        let argv0 = std::env::args().next().unwrap_or_else(|| "tchannel".to_string());
        ConnectionOptions {
            host_port: "0.0.0.0:0".to_string(),
            process_name: format!("{argv0}[{}]", std::process::id()),
            headers: HashMap::new(),
            events: Arc::new(NullEventSink),
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> ConnectionOptions {
        ConnectionOptions::default()
    }

    /// Address at which this process can be reached, as `"<host>:<port>"`.
    pub fn with_host_port(mut self, host_port: impl Into<String>) -> Self {
        self.host_port = host_port.into();
        self
    }

    pub fn with_process_name(mut self, process_name: impl Into<String>) -> Self {
        self.process_name = process_name.into();
        self
    }

    /// Extra handshake header to send alongside the required ones.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The full header map for an INIT message.
    pub fn handshake_headers(&self) -> HashMap<String, String> {
        let mut headers = self.headers.clone();
        headers.insert(
            init_headers::HOST_PORT.to_string(),
            self.host_port.clone(),
        );
        headers.insert(
            init_headers::PROCESS_NAME.to_string(),
            self.process_name.clone(),
        );
        headers
    }
}

/// Slot that resolves with the reassembled response to a call, or with the
/// error that ended it. Dropping the slot abandons the call; a response that
/// arrives afterwards is discarded.
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Message>>,
}

impl ResponseFuture {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Message>>) -> ResponseFuture {
        ResponseFuture { rx }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(outcome) => outcome,
            Err(_) => Err(TChannelError::closed()),
        })
    }
}

/// Completes once a submitted message has been fully written to the stream,
/// or fails if the stream breaks first.
pub struct WriteFuture {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for WriteFuture {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(outcome) => outcome,
            Err(_) => Err(TChannelError::closed()),
        })
    }
}

// ---------------------------------------------------------------------------
// Reader

/// Owns the inbound half of the stream. A single fill task reads frames,
/// decodes them, and pushes messages onto an unbounded queue; `next` takes
/// from that queue. A decode failure is surfaced once and leaves the reader
/// in a terminal failed state.
pub(crate) struct Reader {
    queue: mpsc::UnboundedReceiver<Result<Message>>,
    failed: Option<String>,
}

impl Reader {
    fn new<R>(read_half: R, closed: watch::Receiver<bool>) -> Reader
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::fill(read_half, tx, closed));
        Reader {
            queue: rx,
            failed: None,
        }
    }

    async fn fill<R: AsyncRead + Unpin>(
        mut stream: R,
        queue: mpsc::UnboundedSender<Result<Message>>,
        mut closed: watch::Receiver<bool>,
    ) {
        loop {
            let result = tokio::select! {
                result = read_message(&mut stream) => result,
                _ = closed.wait_for(|closed| *closed) => return,
            };
            match result {
                Ok(message) => {
                    if queue.send(Ok(message)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = queue.send(Err(err));
                    return;
                }
            }
        }
    }

    /// Receive the next message off the wire, in arrival order.
    pub(crate) async fn next(&mut self) -> Result<Message> {
        if let Some(reason) = &self.failed {
            return Err(TChannelError::Network(reason.clone()));
        }
        match self.queue.recv().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(err)) => {
                self.failed = Some(err.to_string());
                Err(err)
            }
            None => {
                self.failed = Some("connection closed".to_string());
                Err(TChannelError::closed())
            }
        }
    }
}

async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Message> {
    let mut size_buf = [0u8; SIZE_WIDTH];
    read_exact(stream, &mut size_buf).await?;

    let size = u16::from_be_bytes(size_buf) as usize;
    if size < FRAME_OVERHEAD {
        return Err(CodecError::FrameTooSmall(size).into());
    }

    let mut buf = vec![0u8; size];
    buf[..SIZE_WIDTH].copy_from_slice(&size_buf);
    read_exact(stream, &mut buf[SIZE_WIDTH..]).await?;

    let frame = Frame::decode(&mut Cursor::new(buf.as_slice()))?;
    Ok(Message::decode(&frame)?)
}

async fn read_exact<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(TChannelError::closed()),
        Err(err) => Err(TChannelError::Io(err)),
    }
}

// ---------------------------------------------------------------------------
// Writer

struct WriteOp {
    body: bytes::Bytes,
    done: oneshot::Sender<Result<()>>,
}

/// Owns the outbound half of the stream and the message-id sequence. A
/// single drain task writes queued frames in FIFO order; concurrent submits
/// serialize through the queue, so bytes reach the wire in submit order.
pub(crate) struct Writer {
    queue: mpsc::UnboundedSender<WriteOp>,
    id_sequence: AtomicU32,
}

impl Writer {
    fn new<W>(write_half: W, closed: watch::Receiver<bool>) -> Writer
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::drain(write_half, rx, closed));
        Writer {
            queue: tx,
            id_sequence: AtomicU32::new(0),
        }
    }

    async fn drain<W: AsyncWrite + Unpin>(
        mut stream: W,
        mut queue: mpsc::UnboundedReceiver<WriteOp>,
        mut closed: watch::Receiver<bool>,
    ) {
        loop {
            let op = tokio::select! {
                op = queue.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
                _ = closed.wait_for(|closed| *closed) => break,
            };
            let result = match stream.write_all(&op.body).await {
                Ok(()) => stream.flush().await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    let _ = op.done.send(Ok(()));
                }
                Err(err) => {
                    error!(error = %err, "write to stream failed");
                    let _ = op.done.send(Err(TChannelError::Io(err)));
                    break;
                }
            }
        }
    }

    /// Encode the message, frame it, and queue the bytes for the drain task.
    /// The returned receiver resolves once the frame has hit the stream.
    pub(crate) fn submit(&self, mut message: Message) -> Result<oneshot::Receiver<Result<()>>> {
        if message.id() == 0 {
            message.set_id(self.next_id());
        }
        let body = message.to_frame()?.encode()?;
        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .send(WriteOp {
                body,
                done: done_tx,
            })
            .map_err(|_| TChannelError::closed())?;
        Ok(done_rx)
    }

    /// Next id from the monotonic sequence; zero is reserved and skipped.
    pub(crate) fn next_id(&self) -> u32 {
        let previous = self
            .id_sequence
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(next_message_id(id))
            })
            .unwrap_or_default();
        next_message_id(previous)
    }
}

fn next_message_id(id: u32) -> u32 {
    let next = id.wrapping_add(1) % MAX_MESSAGE_ID;
    if next == 0 { 1 } else { next }
}

// ---------------------------------------------------------------------------
// Connection

type CloseCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct Inner {
    direction: Direction,
    closed: AtomicBool,
    dispatching: AtomicBool,
    pub(crate) writer: Writer,
    reader: Mutex<Option<Reader>>,
    request_factory: Mutex<MessageFactory>,
    response_factory: Mutex<MessageFactory>,
    pub(crate) outstanding: Mutex<HashMap<u32, oneshot::Sender<Result<Message>>>>,
    pub(crate) tombstones: Mutex<Tombstones>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    peer: Mutex<PeerInfo>,
    close_callback: Mutex<Option<CloseCallback>>,
    close_signal: watch::Sender<bool>,
    pub(crate) events: Arc<dyn EventSink>,
}

/// One end of a TChannel conversation. Cheap to clone; all clones share the
/// same underlying state.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl Connection {
    /// Wrap an open stream. The connection is unusable until one of the
    /// handshake operations completes.
    pub fn new<S>(stream: S, direction: Direction) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_event_sink(stream, direction, Arc::new(NullEventSink))
    }

    pub fn with_event_sink<S>(
        stream: S,
        direction: Direction,
        events: Arc<dyn EventSink>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (close_tx, _) = watch::channel(false);
        let reader = Reader::new(read_half, close_tx.subscribe());
        let writer = Writer::new(write_half, close_tx.subscribe());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Connection {
            inner: Arc::new(Inner {
                direction,
                closed: AtomicBool::new(false),
                dispatching: AtomicBool::new(false),
                writer,
                reader: Mutex::new(Some(reader)),
                request_factory: Mutex::new(MessageFactory::new()),
                response_factory: Mutex::new(MessageFactory::new()),
                outstanding: Mutex::new(HashMap::new()),
                tombstones: Mutex::new(Tombstones::new()),
                inbound_tx,
                inbound_rx: AsyncMutex::new(inbound_rx),
                peer: Mutex::new(PeerInfo::default()),
                close_callback: Mutex::new(None),
                close_signal: close_tx,
                events,
            }),
        }
    }

    /// Connect to `hostport`, perform the handshake, and hand back a
    /// dispatching connection.
    pub async fn outgoing(hostport: &str, options: ConnectionOptions) -> Result<Connection> {
        let stream = TcpStream::connect(hostport).await.map_err(|err| {
            warn!(hostport, error = %err, "couldn't connect");
            TChannelError::Network(format!("couldn't connect to {hostport}: {err}"))
        })?;

        debug!(hostport, "performing handshake");
        let connection =
            Connection::with_event_sink(stream, Direction::Outgoing, options.events.clone());
        connection
            .initiate_handshake(options.handshake_headers())
            .await?;
        Ok(connection)
    }

    /// Send an INIT_REQ with the given headers, await and validate the
    /// INIT_RES, then start the dispatch loop. Valid only on a new
    /// connection.
    pub async fn initiate_handshake(&self, headers: HashMap<String, String>) -> Result<()> {
        let mut reader = self.take_reader();

        self.write(Message::InitRequest(InitRequest {
            id: 0,
            version: PROTOCOL_VERSION,
            headers,
        }))?;

        let init_res = match reader.next().await? {
            Message::InitResponse(init_res) => init_res,
            other => {
                return Err(TChannelError::InvalidMessage(format!(
                    "expected a handshake response, got {:?}",
                    other.message_type()
                )));
            }
        };
        self.inner.record_peer(init_res.version, &init_res.headers)?;

        self.start_dispatch(reader);
        Ok(())
    }

    /// Await an INIT_REQ, validate it, reply with an INIT_RES carrying the
    /// given headers, then start the dispatch loop. Valid only on a new
    /// connection.
    pub async fn expect_handshake(&self, headers: HashMap<String, String>) -> Result<()> {
        let mut reader = self.take_reader();

        let init_req = match reader.next().await? {
            Message::InitRequest(init_req) => init_req,
            other => {
                return Err(TChannelError::InvalidMessage(format!(
                    "you need to shake my hand first, got {:?}",
                    other.message_type()
                )));
            }
        };
        self.inner.record_peer(init_req.version, &init_req.headers)?;

        self.write(Message::InitResponse(InitResponse {
            id: init_req.id,
            version: PROTOCOL_VERSION,
            headers,
        }))?;

        self.start_dispatch(reader);
        Ok(())
    }

    fn take_reader(&self) -> Reader {
        assert!(!self.is_closed(), "connection is closed");
        self.inner
            .reader
            .lock()
            .unwrap()
            .take()
            .expect("handshake may only be performed once per connection")
    }

    fn start_dispatch(&self, reader: Reader) {
        self.inner.dispatching.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(Inner::dispatch_loop(inner, reader));
    }

    /// Send a call and register a slot for its response.
    ///
    /// The message type must be CALL_REQ or CALL_REQ_CONTINUE; an id is
    /// assigned if the message carries none. The slot completes with the
    /// fully reassembled response, or fails with a protocol error, a
    /// timeout, or a network error.
    pub fn send(&self, mut message: Message) -> ResponseFuture {
        assert!(self.inner.is_dispatching(), "perform a handshake first");
        assert!(
            message.message_type().is_call_request(),
            "message type {:?} can't use send",
            message.message_type()
        );

        if message.id() == 0 {
            message.set_id(self.inner.writer.next_id());
        }
        let id = message.id();
        let rx = self.inner.register_slot(id);

        if let Err(err) = self.write(message) {
            self.inner.fail_slot(id, err);
        }
        ResponseFuture { rx }
    }

    /// Write a message up the wire without expecting a response, fragmenting
    /// as needed. The returned future resolves when the last frame has been
    /// written.
    pub fn write(&self, mut message: Message) -> Result<WriteFuture> {
        if message.id() == 0 {
            message.set_id(self.inner.writer.next_id());
        }

        let message_type = message.message_type();
        let fragments = if message_type.is_call_request() {
            self.inner.request_factory.lock().unwrap().fragment(message)?
        } else if message_type.is_call_response() {
            self.inner
                .response_factory
                .lock()
                .unwrap()
                .fragment(message)?
        } else {
            vec![message]
        };

        let mut done = None;
        for fragment in fragments {
            done = Some(self.inner.writer.submit(fragment)?);
        }
        Ok(WriteFuture {
            rx: done.expect("fragmenter emits at least one frame"),
        })
    }

    /// Receive the next reassembled incoming call.
    pub async fn next_call(&self) -> Result<Message> {
        assert!(
            self.inner.is_dispatching() || self.is_closed(),
            "perform a handshake first"
        );
        let mut closed = self.inner.close_signal.subscribe();
        let mut inbound = self.inner.inbound_rx.lock().await;
        tokio::select! {
            message = inbound.recv() => message.ok_or_else(TChannelError::closed),
            _ = closed.wait_for(|closed| *closed) => Err(TChannelError::closed()),
        }
    }

    /// Serve incoming calls with the given handler until the connection
    /// closes. A handler failure is logged and answered with an ERROR frame.
    pub async fn serve<H>(&self, mut handler: H) -> Result<()>
    where
        H: FnMut(Message, &Connection) -> Result<()>,
    {
        assert!(self.inner.is_dispatching(), "finish the handshake first");
        while !self.is_closed() {
            let call = match self.next_call().await {
                Ok(call) => call,
                Err(_) => break,
            };
            let id = call.id();
            let tracing = match &call {
                Message::CallRequest(request) => request.tracing,
                _ => Tracing::default(),
            };
            if let Err(err) = handler(call, self) {
                error!(id, error = %err, "failed to process incoming call");
                let _ = self
                    .send_error(ErrorMessage {
                        id,
                        code: ErrorCode::UnexpectedError,
                        tracing,
                        description: err.to_string(),
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Submit a PING_REQ; the slot completes with the peer's PING_RES.
    pub fn ping(&self) -> ResponseFuture {
        let id = self.inner.writer.next_id();
        let rx = self.inner.register_slot(id);
        if let Err(err) = self
            .inner
            .writer
            .submit(Message::PingRequest(PingRequest { id }))
        {
            self.inner.fail_slot(id, err);
        }
        ResponseFuture { rx }
    }

    /// Submit a PING_RES.
    pub fn pong(&self) -> Result<WriteFuture> {
        self.write(Message::PingResponse(PingResponse { id: 0 }))
    }

    /// Write an ERROR frame up the wire; fires `after_send_error` once the
    /// write completes.
    pub async fn send_error(&self, error: ErrorMessage) -> Result<()> {
        let done = self.write(Message::Error(error.clone()))?;
        done.await?;
        self.inner.events.after_send_error(&error);
        Ok(())
    }

    /// Close the underlying stream and run the shutdown path. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// Register the single callback fired after shutdown completes.
    /// Re-registration is a programming error.
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.inner.close_callback.lock().unwrap();
        assert!(
            slot.is_none(),
            "a close callback has already been set for this connection"
        );
        *slot = Some(Box::new(callback));
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Peer identity recorded at handshake.
    pub fn peer(&self) -> PeerInfo {
        self.inner.peer.lock().unwrap().clone()
    }

    pub fn remote_host(&self) -> String {
        self.peer().host
    }

    pub fn remote_host_port(&self) -> u16 {
        self.peer().port
    }

    pub fn remote_process_name(&self) -> Option<String> {
        self.peer().process_name
    }

    pub fn requested_version(&self) -> u16 {
        self.peer().version
    }

    #[cfg(test)]
    pub(crate) fn outstanding_count(&self) -> usize {
        self.inner.outstanding.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn is_tombstoned(&self, id: u32) -> bool {
        self.inner.tombstones.lock().unwrap().contains(id)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("direction", &self.inner.direction)
            .field("closed", &self.is_closed())
            .field("dispatching", &self.inner.is_dispatching())
            .field("peer", &self.peer())
            .finish()
    }
}

impl Inner {
    pub(crate) fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn register_slot(&self, id: u32) -> oneshot::Receiver<Result<Message>> {
        let (tx, rx) = oneshot::channel();
        let mut outstanding = self.outstanding.lock().unwrap();
        assert!(
            !outstanding.contains_key(&id),
            "message id {id} already being used"
        );
        outstanding.insert(id, tx);
        rx
    }

    pub(crate) fn fail_slot(&self, id: u32, err: TChannelError) {
        if let Some(slot) = self.outstanding.lock().unwrap().remove(&id) {
            let _ = slot.send(Err(err));
        }
    }

    fn required_header<'a>(
        headers: &'a HashMap<String, String>,
        name: &str,
    ) -> Result<&'a str> {
        match headers.get(name) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(TChannelError::InvalidMessage(format!(
                "missing required header: {name}"
            ))),
        }
    }

    fn record_peer(&self, version: u16, headers: &HashMap<String, String>) -> Result<()> {
        let host_port = Self::required_header(headers, init_headers::HOST_PORT)?;
        let process_name = Self::required_header(headers, init_headers::PROCESS_NAME)?;

        let (host, port) = host_port.rsplit_once(':').ok_or_else(|| {
            TChannelError::InvalidMessage(format!("malformed host_port header: {host_port}"))
        })?;
        let port: u16 = port.parse().map_err(|_| {
            TChannelError::InvalidMessage(format!("malformed host_port header: {host_port}"))
        })?;

        let mut peer = self.peer.lock().unwrap();
        peer.host = host.to_string();
        peer.port = port;
        peer.process_name = Some(process_name.to_string());
        peer.version = version;
        Ok(())
    }

    async fn dispatch_loop(inner: Arc<Inner>, mut reader: Reader) {
        // All incoming messages are either responses to outstanding calls
        // or calls themselves. A read or decode failure ends the loop and
        // tears the connection down.
        while !inner.is_closed() {
            let message = match reader.next().await {
                Ok(message) => message,
                Err(err) => {
                    if !inner.is_closed() {
                        debug!(error = %err, "receive loop ended");
                    }
                    break;
                }
            };
            inner.dispatch(message);
        }
        inner.shutdown();
    }

    fn dispatch(&self, message: Message) {
        let message_type = message.message_type();

        if message_type.is_call_request() {
            match self.request_factory.lock().unwrap().build(message) {
                Ok(Some(call)) => {
                    let _ = self.inbound_tx.send(call);
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "dropping invalid inbound call fragment"),
            }
            return;
        }

        if let Message::PingRequest(ping) = &message {
            let _ = self
                .writer
                .submit(Message::PingResponse(PingResponse { id: ping.id }));
            return;
        }

        let id = message.id();
        if self.outstanding.lock().unwrap().contains_key(&id) {
            self.dispatch_response(id, message);
            return;
        }

        if self.tombstones.lock().unwrap().contains(id) {
            // recently timed out; safe to ignore
            return;
        }

        warn!(id, message_type = ?message_type, "unconsumed message");
    }

    fn dispatch_response(&self, id: u32, message: Message) {
        let message = match message {
            Message::Error(error_message) => {
                let slot = self.outstanding.lock().unwrap().remove(&id);
                let error = TChannelError::from_error_message(&error_message);
                let _ = self
                    .response_factory
                    .lock()
                    .unwrap()
                    .build(Message::Error(error_message));
                match slot {
                    Some(slot) if !slot.is_closed() => {
                        let _ = slot.send(Err(error));
                    }
                    _ => self.events.after_receive_error(&error),
                }
                return;
            }
            message => message,
        };

        match self.response_factory.lock().unwrap().build(message) {
            // mid-chain fragment; the slot stays in place
            Ok(None) => {}
            Ok(Some(response)) => {
                if let Some(slot) = self.outstanding.lock().unwrap().remove(&id) {
                    if !slot.is_closed() {
                        let _ = slot.send(Ok(response));
                    }
                }
            }
            Err(err) => {
                if let Some(slot) = self.outstanding.lock().unwrap().remove(&id) {
                    if !slot.is_closed() {
                        let _ = slot.send(Err(err));
                    }
                }
            }
        }
    }

    /// Per-call timeout: if it fires before the response lands, the slot is
    /// failed and the id buried so the late response is dropped silently.
    pub(crate) fn spawn_timeout(self: &Arc<Inner>, id: u32, ttl: std::time::Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let slot = inner.outstanding.lock().unwrap().remove(&id);
            if let Some(slot) = slot {
                if !slot.is_closed() {
                    let _ = slot.send(Err(TChannelError::Timeout));
                }
                inner.tombstones.lock().unwrap().add(id, ttl);
            }
        });
    }

    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatching.store(false, Ordering::SeqCst);
        let _ = self.close_signal.send(true);

        self.tombstones.lock().unwrap().clear();

        let outstanding = mem::take(&mut *self.outstanding.lock().unwrap());
        for (id, slot) in outstanding {
            let _ = slot.send(Err(TChannelError::Network(format!(
                "canceling outstanding request {id}"
            ))));
        }

        if let Ok(mut inbound) = self.inbound_rx.try_lock() {
            while let Ok(message) = inbound.try_recv() {
                warn!(id = message.id(), "unconsumed message while closing connection");
            }
        }

        if let Some(callback) = self.close_callback.lock().unwrap().take() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_sequence_test() {
        assert_eq!(next_message_id(0), 1);
        assert_eq!(next_message_id(1), 2);
        assert_eq!(next_message_id(41), 42);
    }

    #[test]
    fn message_id_wraps_and_skips_zero_test() {
        assert_eq!(next_message_id(MAX_MESSAGE_ID - 1), 1);
    }

    #[tokio::test]
    async fn writer_preserves_submit_order_test() {
        let (near, far) = tokio::io::duplex(1024);
        let (close_tx, _) = watch::channel(false);
        let (_near_read, near_write) = tokio::io::split(near);
        let writer = Writer::new(near_write, close_tx.subscribe());

        let first = writer
            .submit(Message::PingRequest(PingRequest { id: 0 }))
            .unwrap();
        let second = writer
            .submit(Message::PingRequest(PingRequest { id: 0 }))
            .unwrap();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let mut expected = Message::PingRequest(PingRequest { id: 1 })
            .to_frame()
            .unwrap()
            .encode()
            .unwrap()
            .to_vec();
        expected.extend_from_slice(
            &Message::PingRequest(PingRequest { id: 2 })
                .to_frame()
                .unwrap()
                .encode()
                .unwrap(),
        );

        let (mut far_read, _far_write) = tokio::io::split(far);
        let mut wire = vec![0u8; expected.len()];
        far_read.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, expected);
    }

    #[test]
    fn handshake_headers_include_identity_test() {
        let options = ConnectionOptions::new()
            .with_host_port("10.0.0.1:8888")
            .with_process_name("worker")
            .with_header("tchannel_language", "rust");

        let headers = options.handshake_headers();
        assert_eq!(headers["host_port"], "10.0.0.1:8888");
        assert_eq!(headers["process_name"], "worker");
        assert_eq!(headers["tchannel_language"], "rust");
    }
}
