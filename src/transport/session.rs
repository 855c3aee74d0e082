//! Per-connection session.
//!
//! A [`Session`] owns one upgraded WebSocket connection and one
//! [`OutboundQueue`]. Starting it spawns three tasks:
//!
//! ```text
//!            ┌──────────────┐  decode   ┌──────────┐
//!  peer ───► │ receive loop │ ────────► │ handler  │
//!            └──────┬───────┘           └────┬─────┘
//!                   │ close()                │ send()
//!                   ▼                        ▼
//!            ┌──────────────┐  drain    ┌──────────┐
//!  peer ◄─── │  send loop   │ ◄──────── │  queue   │
//!            └──────┬───────┘           └──────────┘
//!                   │ both finished
//!                   ▼
//!            ┌──────────────┐
//!            │  join task   │ ──► close hook (deregistration)
//!            └──────────────┘
//! ```
//!
//! # States
//!
//! `Created → Live → Closing → Closed`. [`Session::close`] moves to
//! `Closing` exactly once and queues the stop marker; the send loop writes
//! everything queued before it, closes the connection, and wakes the receive
//! loop. The close hook runs once both loops have returned.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{Instrument, Span, debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::{
    CLOSE_CODE_ERROR, Codec, Envelope, MIN_FRAME_LEN, MessageHandler, SessionEvent,
};

use super::WsStream;
use super::queue::OutboundQueue;

// ============================================================================
// Constants
// ============================================================================

const STATE_CREATED: u8 = 0;
const STATE_LIVE: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

// ============================================================================
// Types
// ============================================================================

/// Open/close hook invoked once per session lifecycle.
pub type SessionHook<C> = Arc<dyn Fn(&Arc<Session<C>>) + Send + Sync>;

/// Hook invoked after each outbound message is handed to the connection.
pub type SentHook<C> = Arc<dyn Fn(&Arc<Session<C>>, &<C as Codec>::Message) + Send + Sync>;

/// Write half of a session connection.
type SessionSink = SplitSink<WsStream, Message>;

/// Read half of a session connection.
type SessionStream = SplitStream<WsStream>;

// ============================================================================
// WsSession
// ============================================================================

/// Operations the registry and the engine need from a session.
pub trait WsSession: Send + Sync + 'static {
    /// Outbound message type.
    type Message;

    /// Registry-assigned id, [`SessionId::UNASSIGNED`] before registration.
    fn id(&self) -> SessionId;

    /// Stores the registry-assigned id.
    fn assign_id(&self, id: SessionId);

    /// Returns `true` between start and close initiation.
    fn is_live(&self) -> bool;

    /// Client IP captured at accept time.
    fn remote_ip(&self) -> &str;

    /// Queues a message for the peer. No-op unless live.
    fn send(&self, message: Self::Message);

    /// Starts an asynchronous close. Idempotent.
    fn close(&self);
}

// ============================================================================
// SessionContext
// ============================================================================

/// Settings shared by every session an engine creates.
///
/// Built once and never mutated afterwards.
pub struct SessionContext<C: Codec> {
    codec: Arc<C>,
    handler: Option<MessageHandler<C>>,
    on_open: Option<SessionHook<C>>,
    on_close: Option<SessionHook<C>>,
    on_sent: Option<SentHook<C>>,
    span: Span,
}

impl<C: Codec> SessionContext<C> {
    /// Creates a context with a codec and nothing else.
    #[must_use]
    pub fn new(codec: C) -> Self {
        Self {
            codec: Arc::new(codec),
            handler: None,
            on_open: None,
            on_close: None,
            on_sent: None,
            span: Span::none(),
        }
    }

    /// Sets the application message handler.
    #[must_use]
    pub fn with_handler(mut self, handler: MessageHandler<C>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Sets the hook run at the start of [`Session::start`].
    #[must_use]
    pub fn with_open_hook(mut self, hook: SessionHook<C>) -> Self {
        self.on_open = Some(hook);
        self
    }

    /// Sets the hook run after both session tasks have finished.
    #[must_use]
    pub fn with_close_hook(mut self, hook: SessionHook<C>) -> Self {
        self.on_close = Some(hook);
        self
    }

    /// Sets the hook run after each message is written.
    ///
    /// Not run for messages that fail to encode or write.
    #[must_use]
    pub fn with_sent_hook(mut self, hook: SentHook<C>) -> Self {
        self.on_sent = Some(hook);
        self
    }

    /// Sets the span session tasks run in.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Returns the shared codec.
    #[inline]
    #[must_use]
    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }
}

// ============================================================================
// Session
// ============================================================================

/// One live duplex connection.
pub struct Session<C: Codec> {
    /// Registry-assigned id (0 until registered).
    id: AtomicU64,
    /// Client IP captured at accept time.
    remote_ip: String,
    /// Lifecycle state, one of the `STATE_*` constants.
    state: AtomicU8,
    /// Pending outbound messages.
    queue: OutboundQueue<C::Message>,
    /// Connection, taken by `start`.
    stream: Mutex<Option<WsStream>>,
    /// Raised by the send loop once the connection is closed.
    disconnected: Notify,
    /// Shared codec, handler and hooks.
    context: Arc<SessionContext<C>>,
}

impl<C: Codec> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("remote_ip", &self.remote_ip)
            .field("live", &self.is_live())
            .field("pending", &self.queue.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Session - Public API
// ============================================================================

impl<C: Codec> Session<C> {
    /// Wraps an upgraded connection. Nothing runs until [`start`](Self::start).
    pub fn new(
        stream: WsStream,
        remote_ip: impl Into<String>,
        context: Arc<SessionContext<C>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: AtomicU64::new(SessionId::UNASSIGNED.as_u64()),
            remote_ip: remote_ip.into(),
            state: AtomicU8::new(STATE_CREATED),
            queue: OutboundQueue::new(),
            stream: Mutex::new(Some(stream)),
            disconnected: Notify::new(),
            context,
        })
    }

    /// Returns the registry-assigned id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SessionId {
        SessionId::new(self.id.load(Ordering::Acquire))
    }

    /// Stores the registry-assigned id.
    #[inline]
    pub fn assign_id(&self, id: SessionId) {
        self.id.store(id.as_u64(), Ordering::Release);
    }

    /// Returns the client IP captured at accept time.
    #[inline]
    #[must_use]
    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    /// Returns `true` between start and close initiation.
    #[inline]
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_LIVE
    }

    /// Returns `true` once both session tasks have finished.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Runs the open hook, delivers `Accepted`, and spawns the session tasks.
    ///
    /// Must be called from within a tokio runtime. Only the first call has
    /// any effect.
    pub fn start(self: &Arc<Self>) {
        let Some(stream) = self.stream.lock().take() else {
            warn!(session_id = %self.id(), "Session already started");
            return;
        };

        if let Some(on_open) = &self.context.on_open {
            on_open(self);
        }

        // A close() that ran before this point wins and the session never
        // becomes live.
        let _ = self.state.compare_exchange(
            STATE_CREATED,
            STATE_LIVE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        self.dispatch(SessionEvent::Accepted);

        let (sink, stream) = stream.split();
        let span = self.context.span.clone();

        let receive = tokio::spawn(
            Arc::clone(self)
                .receive_loop(stream)
                .instrument(span.clone()),
        );
        let send = tokio::spawn(Arc::clone(self).send_loop(sink).instrument(span.clone()));
        tokio::spawn(Arc::clone(self).join(receive, send).instrument(span));

        debug!(session_id = %self.id(), remote_ip = %self.remote_ip, "Session started");
    }

    /// Queues a message for the peer.
    ///
    /// Dropped silently unless the session is live. Never blocks.
    pub fn send(&self, message: C::Message) {
        if !self.is_live() {
            trace!(session_id = %self.id(), "Send on inactive session dropped");
            return;
        }

        self.queue.push(message);
    }

    /// Starts closing the session.
    ///
    /// Messages queued before this call are still written. Returns without
    /// waiting for the connection to close.
    pub fn close(&self) {
        let transitioned = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < STATE_CLOSING).then_some(STATE_CLOSING)
            })
            .is_ok();

        if transitioned {
            self.queue.push_stop();
            debug!(session_id = %self.id(), "Session closing");
        }
    }
}

// ============================================================================
// Session - Tasks
// ============================================================================

impl<C: Codec> Session<C> {
    /// Reads frames and dispatches them until the connection ends.
    async fn receive_loop(self: Arc<Self>, mut stream: SessionStream) {
        loop {
            match self.read_message(&mut stream).await {
                Ok(message) => self.dispatch(SessionEvent::Message(message)),
                Err(e) => {
                    if e.is_connection_error() {
                        debug!(session_id = %self.id(), error = %e, "Session read ended");
                    } else {
                        warn!(session_id = %self.id(), error = %e, "Session read failed");
                    }

                    self.close();
                    self.dispatch(SessionEvent::Closed {
                        code: CLOSE_CODE_ERROR,
                    });
                    break;
                }
            }
        }
    }

    /// Writes queued batches until the stop marker, then closes the
    /// connection.
    async fn send_loop(self: Arc<Self>, mut sink: SessionSink) {
        let mut batch = Vec::new();

        loop {
            let stop = self.queue.drain(&mut batch).await;
            self.write_batch(&mut sink, &mut batch).await;

            if stop {
                break;
            }
        }

        if let Err(e) = sink.close().await {
            debug!(session_id = %self.id(), error = %e, "Connection close failed");
        }

        self.disconnected.notify_one();
    }

    /// Waits for both loops, then runs the close hook.
    async fn join(self: Arc<Self>, receive: JoinHandle<()>, send: JoinHandle<()>) {
        let (receive, send) = tokio::join!(receive, send);

        for (task, result) in [("receive", receive), ("send", send)] {
            if let Err(e) = result {
                error!(session_id = %self.id(), task, error = %e, "Session task failed");
            }
        }

        self.state.store(STATE_CLOSED, Ordering::Release);

        if let Some(on_close) = &self.context.on_close {
            on_close(&self);
        }

        debug!(session_id = %self.id(), "Session closed");
    }
}

// ============================================================================
// Session - Frame Handling
// ============================================================================

impl<C: Codec> Session<C> {
    /// Reads the next data frame and decodes it.
    async fn read_message(&self, stream: &mut SessionStream) -> Result<C::Message> {
        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                () = self.disconnected.notified() => return Err(Error::ConnectionClosed),
            };

            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(Error::ConnectionClosed),
            };

            match message {
                Message::Binary(data) => return self.decode_frame(&data),
                Message::Ping(_) | Message::Pong(_) => {
                    trace!(session_id = %self.id(), "Control frame skipped");
                }
                Message::Close(_) => return Err(Error::ConnectionClosed),
                Message::Text(_) => return Err(Error::unexpected_frame("text")),
                Message::Frame(_) => return Err(Error::unexpected_frame("raw")),
            }
        }
    }

    /// Decodes one binary frame. Decoder panics become codec errors.
    fn decode_frame(&self, data: &[u8]) -> Result<C::Message> {
        if data.len() < MIN_FRAME_LEN {
            return Err(Error::frame_too_short(data.len()));
        }

        let codec = &self.context.codec;
        panic::catch_unwind(AssertUnwindSafe(|| codec.decode(data))).unwrap_or_else(|payload| {
            Err(Error::codec(format!(
                "decoder panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }

    /// Writes a drained batch with one flush at the end. A failed message
    /// does not stop the rest of the batch.
    async fn write_batch<S>(self: &Arc<Self>, sink: &mut S, batch: &mut Vec<C::Message>)
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let count = batch.len();
        if count == 0 {
            return;
        }

        for message in batch.drain(..) {
            self.write_message(&mut *sink, &message).await;
        }

        if let Err(e) = sink.flush().await {
            warn!(session_id = %self.id(), error = %e, "Flush failed");
        }
        trace!(session_id = %self.id(), count, "Outbound batch written");
    }

    /// Encodes and feeds one message. Failures are logged and skipped.
    async fn write_message<S>(self: &Arc<Self>, sink: &mut S, message: &C::Message)
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let data = match self.context.codec.encode(message) {
            Ok(data) => data,
            Err(e) => {
                warn!(session_id = %self.id(), error = %e, "Encode failed, message dropped");
                return;
            }
        };

        if let Err(e) = sink.feed(Message::Binary(data.into())).await {
            warn!(session_id = %self.id(), error = %e, "Write failed");
            return;
        }

        if let Some(on_sent) = &self.context.on_sent {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_sent(self, message))) {
                error!(
                    session_id = %self.id(),
                    panic = panic_message(payload.as_ref()),
                    "Sent hook panicked"
                );
            }
        }
    }

    /// Hands one event to the handler. Handler panics are logged.
    fn dispatch(self: &Arc<Self>, event: SessionEvent<C::Message>) {
        let Some(handler) = &self.context.handler else {
            return;
        };

        let envelope = Envelope::new(Arc::clone(self), event);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
            error!(
                session_id = %self.id(),
                panic = panic_message(payload.as_ref()),
                "Message handler panicked"
            );
        }
    }
}

// ============================================================================
// WsSession Implementation
// ============================================================================

impl<C: Codec> WsSession for Session<C> {
    type Message = C::Message;

    #[inline]
    fn id(&self) -> SessionId {
        Session::id(self)
    }

    #[inline]
    fn assign_id(&self, id: SessionId) {
        Session::assign_id(self, id);
    }

    #[inline]
    fn is_live(&self) -> bool {
        Session::is_live(self)
    }

    #[inline]
    fn remote_ip(&self) -> &str {
        Session::remote_ip(self)
    }

    #[inline]
    fn send(&self, message: C::Message) {
        Session::send(self, message);
    }

    #[inline]
    fn close(&self) {
        Session::close(self);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// ============================================================================
// Tests
// ============================================================================
