//! Session engine coordinator.
//!
//! The [`Engine`] ties the listener, the session registry, the codec and the
//! application handler together.
//!
//! # Lifecycle
//!
//! ```text
//! build() ──► start() ──► stop()
//!               │           │
//!               │           ├─ listener stops accepting
//!               │           └─ close_all() on the registry
//!               └─ bind + accept loop
//! ```
//!
//! Both transitions happen at most once. A stopped engine cannot be
//! restarted; build a new one instead.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{Span, debug, error, info};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::{Codec, JsonCodec, MessageHandler};
use crate::transport::{
    ConnOpenHandler, Listener, SentHook, Session, SessionContext, SessionHook, SessionManager,
    SessionRegistry, WsStream,
};

use super::builder::EngineBuilder;
use super::config::EngineConfig;

// ============================================================================
// Types
// ============================================================================

type Registry<C> = SessionRegistry<Session<C>>;

/// One-way lifecycle flags.
#[derive(Debug, Default)]
struct Lifecycle {
    started: bool,
    closed: bool,
}

/// Internal shared state for the engine.
struct EngineInner<C: Codec> {
    /// Settings the engine was built with.
    config: EngineConfig,
    /// Accepts and upgrades connections.
    listener: Listener,
    /// Live sessions.
    registry: Arc<Registry<C>>,
    /// Codec, handler and registry hooks shared by every session.
    context: Arc<SessionContext<C>>,
    /// Cleared by `stop()`; late upgrades are dropped.
    accepting: Arc<AtomicBool>,
    /// Serializes `start()` and `stop()`.
    lifecycle: Mutex<Lifecycle>,
    /// Parent span of all engine tasks.
    span: Span,
}

// ============================================================================
// Engine
// ============================================================================

/// WebSocket session engine.
///
/// Cheap to clone; clones share the same listener and sessions.
pub struct Engine<C: Codec = JsonCodec> {
    /// Shared inner state.
    inner: Arc<EngineInner<C>>,
}

impl<C: Codec> Clone for Engine<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

// ============================================================================
// Engine - Display
// ============================================================================

impl<C: Codec> fmt::Debug for Engine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("serv_id", &self.inner.config.serv_id)
            .field("port", &self.port())
            .field("session_count", &self.session_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Engine - Construction
// ============================================================================

impl Engine<JsonCodec> {
    /// Creates a configuration builder for the engine.
    #[inline]
    #[must_use]
    pub fn builder() -> EngineBuilder<JsonCodec> {
        EngineBuilder::new()
    }
}

impl<C: Codec> Engine<C> {
    /// Assembles an engine from validated parts.
    pub(crate) fn new(
        config: EngineConfig,
        codec: C,
        handler: Option<MessageHandler<C>>,
        on_sent: Option<SentHook<C>>,
        span: Span,
    ) -> Self {
        let registry = Arc::new(Registry::<C>::with_seed(config.resolved_id_seed()));
        let accepting = Arc::new(AtomicBool::new(false));

        let mut context = SessionContext::new(codec)
            .with_open_hook(register_hook(Arc::downgrade(&registry), Arc::clone(&accepting)))
            .with_close_hook(deregister_hook(Arc::downgrade(&registry)))
            .with_span(span.clone());
        if let Some(handler) = handler {
            context = context.with_handler(handler);
        }
        if let Some(on_sent) = on_sent {
            context = context.with_sent_hook(on_sent);
        }

        let mut listener =
            Listener::new(config.addr.clone(), config.port, config.path.clone()).with_span(span.clone());
        if let Some((cert_file, key_file)) = config.tls_files() {
            listener = listener.with_tls(cert_file.clone(), key_file.clone());
        }

        Self {
            inner: Arc::new(EngineInner {
                config,
                listener,
                registry,
                context: Arc::new(context),
                accepting,
                lifecycle: Mutex::new(Lifecycle::default()),
                span,
            }),
        }
    }
}

// ============================================================================
// Engine - Lifecycle
// ============================================================================

impl<C: Codec> Engine<C> {
    /// Binds the listener and starts accepting sessions.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if the engine is running
    /// - [`Error::EngineClosed`] if the engine has been stopped
    /// - [`Error::Io`] if the address cannot be bound
    /// - [`Error::Tls`] / [`Error::Rustls`] if TLS material cannot be loaded
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;

        if lifecycle.closed {
            return Err(Error::EngineClosed);
        }
        if lifecycle.started {
            return Err(Error::AlreadyStarted);
        }

        self.inner.accepting.store(true, Ordering::SeqCst);

        if let Err(e) = self.inner.listener.start(self.open_handler()).await {
            self.inner.accepting.store(false, Ordering::SeqCst);
            self.inner.span.in_scope(|| error!(error = %e, "Engine failed to start"));
            return Err(e);
        }

        lifecycle.started = true;

        self.inner.span.in_scope(|| {
            info!(
                port = self.port(),
                path = %self.inner.config.path,
                tls = self.inner.listener.is_tls(),
                "Engine started"
            );
        });

        Ok(())
    }

    /// Stops accepting connections and starts closing every session.
    ///
    /// Returns once the accept loop has exited; sessions finish closing in
    /// the background. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;

        if lifecycle.closed {
            return;
        }
        lifecycle.closed = true;

        // Cleared before the snapshot in close_all(); the register hook
        // checks it after adding.
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.listener.stop().await;
        self.inner.registry.close_all();

        self.inner.span.in_scope(|| {
            info!(sessions = self.session_count(), "Engine stopped");
        });
    }

    /// Returns `true` while the listener is accepting connections.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.listener.is_ready()
    }

    /// Connection-open callback handed to the listener.
    fn open_handler(&self) -> ConnOpenHandler {
        let context = Arc::clone(&self.inner.context);
        let accepting = Arc::clone(&self.inner.accepting);

        Arc::new(move |stream: WsStream, remote_ip: String| {
            if !accepting.load(Ordering::SeqCst) {
                debug!(%remote_ip, "Connection after stop dropped");
                return;
            }

            let session = Session::new(stream, remote_ip, Arc::clone(&context));
            session.start();
        })
    }
}

// ============================================================================
// Engine - Sessions
// ============================================================================

impl<C: Codec> Engine<C> {
    /// Looks up a live session.
    #[inline]
    #[must_use]
    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session<C>>> {
        self.inner.registry.get(id)
    }

    /// Starts closing a session. Returns `false` if the id is unknown.
    pub fn close_session(&self, id: SessionId) -> bool {
        match self.inner.registry.get(id) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Queues a message for one session. Returns `false` if the id is
    /// unknown.
    pub fn send_to(&self, id: SessionId, message: C::Message) -> bool {
        match self.inner.registry.get(id) {
            Some(session) => {
                session.send(message);
                true
            }
            None => false,
        }
    }

    /// Like [`send_to`](Self::send_to), but reports an unknown id as an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if no session has this id.
    pub fn try_send_to(&self, id: SessionId, message: C::Message) -> Result<()> {
        let session = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| Error::session_not_found(id))?;
        session.send(message);
        Ok(())
    }

    /// Queues a copy of `message` on every registered session.
    ///
    /// Fire-and-forget: never waits on any peer.
    pub fn broadcast(&self, message: &C::Message) {
        let mut count = 0usize;

        self.inner.registry.for_each(|session| {
            session.send(message.clone());
            count += 1;
            true
        });

        self.inner.span.in_scope(|| debug!(count, "Broadcast queued"));
    }

    /// Returns the number of registered sessions.
    #[inline]
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.registry.count()
    }

    /// Returns the ids of all registered sessions.
    #[inline]
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.registry.ids()
    }
}

// ============================================================================
// Engine - Accessors
// ============================================================================

impl<C: Codec> Engine<C> {
    /// Returns the configuration the engine was built with.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns the bound port once started, the configured port before.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.listener.port()
    }

    /// Returns the bound address once started.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.local_addr()
    }
}

// ============================================================================
// Registry Hooks
// ============================================================================

/// Registers the session, then closes it if the engine stopped meanwhile.
///
/// A session registered after `stop()` took its snapshot is closed here, so
/// none outlives the engine.
fn register_hook<C: Codec>(
    registry: Weak<Registry<C>>,
    accepting: Arc<AtomicBool>,
) -> SessionHook<C> {
    Arc::new(move |session: &Arc<Session<C>>| {
        let Some(registry) = registry.upgrade() else {
            session.close();
            return;
        };

        let id = registry.add(Arc::clone(session));
        if !accepting.load(Ordering::SeqCst) {
            debug!(session_id = %id, "Session registered after stop, closing");
            session.close();
        }
    })
}

fn deregister_hook<C: Codec>(registry: Weak<Registry<C>>) -> SessionHook<C> {
    Arc::new(move |session: &Arc<Session<C>>| {
        if let Some(registry) = registry.upgrade() {
            registry.remove(session);
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::future::Future;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use tempfile::NamedTempFile;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    use crate::protocol::{CLOSE_CODE_ERROR, Envelope, SessionEvent};
    use crate::transport::BoxedTransport;

    const WAIT: Duration = Duration::from_secs(5);

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn echo(envelope: Envelope<JsonCodec>) {
        if let SessionEvent::Message(value) = envelope.event {
            envelope.session.send(value);
        }
    }

    async fn started(builder: EngineBuilder<JsonCodec>) -> Engine {
        let engine = builder.addr("127.0.0.1").port(0).build().unwrap();
        engine.start().await.unwrap();
        engine
    }

    async fn connect(engine: &Engine) -> Client {
        let url = format!("ws://127.0.0.1:{}/ws", engine.port());
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        timeout(WAIT, async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn within<T>(future: impl Future<Output = T>) -> T {
        timeout(WAIT, future).await.expect("timed out")
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            match within(client.next()).await.unwrap().unwrap() {
                Message::Binary(data) => return serde_json::from_slice(&data).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    async fn closed_by_server(client: &mut Client) -> bool {
        loop {
            match within(client.next()).await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let engine = started(Engine::builder().handler(echo)).await;
        let mut client = connect(&engine).await;

        client
            .send(Message::binary(br#"{"hello":"x"}"#.to_vec()))
            .await
            .unwrap();

        assert_eq!(next_json(&mut client).await, json!({"hello": "x"}));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_sent_hook_counts_replies() {
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sent);
        let engine = started(Engine::builder().handler(echo).on_sent(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await;
        let mut client = connect(&engine).await;

        for n in 0..2 {
            client
                .send(Message::binary(serde_json::to_vec(&json!({ "n": n })).unwrap()))
                .await
                .unwrap();
            assert_eq!(next_json(&mut client).await, json!({ "n": n }));
        }

        wait_until(|| sent.load(Ordering::SeqCst) == 2).await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_session_registered_after_stop_is_closed() {
        let registry = Arc::new(Registry::<JsonCodec>::new());
        let accepting = Arc::new(AtomicBool::new(true));
        let context = Arc::new(
            SessionContext::new(JsonCodec)
                .with_open_hook(register_hook(Arc::downgrade(&registry), Arc::clone(&accepting)))
                .with_close_hook(deregister_hook(Arc::downgrade(&registry))),
        );

        // Upgrade passed the accepting check, then stop() cleared it and
        // snapshotted the registry before the session registered.
        accepting.store(false, Ordering::SeqCst);
        registry.close_all();

        let (server_io, _client_io) = tokio::io::duplex(1024);
        let stream =
            WebSocketStream::from_raw_socket(Box::new(server_io) as BoxedTransport, Role::Server, None)
                .await;
        let session = Session::new(stream, "127.0.0.1", context);
        session.start();

        assert_ne!(session.id(), SessionId::UNASSIGNED);
        assert!(!session.is_live());
        wait_until(|| registry.count() == 0).await;
        wait_until(|| session.is_closed()).await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let engine = started(Engine::builder()).await;

        let mut clients = Vec::new();
        for _ in 0..50 {
            clients.push(connect(&engine).await);
        }
        wait_until(|| engine.session_count() == 50).await;

        let message = json!({"event": "tick", "n": 1});
        engine.broadcast(&message);

        for client in &mut clients {
            assert_eq!(next_json(client).await, message);
        }

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let engine = Engine::builder().addr("127.0.0.1").build().unwrap();
        assert!(!engine.is_ready());

        engine.start().await.unwrap();
        assert!(engine.is_ready());
        assert!(engine.local_addr().is_some());
        assert!(matches!(engine.start().await, Err(Error::AlreadyStarted)));

        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_ready());
        assert!(matches!(engine.start().await, Err(Error::EngineClosed)));
    }

    #[tokio::test]
    async fn test_bind_failure_is_returned() {
        let first = started(Engine::builder()).await;

        let second = Engine::builder()
            .addr("127.0.0.1")
            .port(first.port())
            .build()
            .unwrap();
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!second.is_ready());

        first.stop().await;
    }

    #[tokio::test]
    async fn test_ids_follow_seed() {
        let engine = started(Engine::builder().id_seed(1000)).await;
        let _client = connect(&engine).await;

        wait_until(|| engine.session_count() == 1).await;
        assert_eq!(engine.session_ids(), vec![SessionId::new(1001)]);

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_and_close_session() {
        let engine = started(Engine::builder()).await;
        let mut client = connect(&engine).await;

        wait_until(|| engine.session_count() == 1).await;
        let id = engine.session_ids()[0];
        assert!(engine.get_session(id).is_some());

        assert!(engine.send_to(id, json!({"to": "you"})));
        assert_eq!(next_json(&mut client).await, json!({"to": "you"}));

        assert!(engine.close_session(id));
        assert!(closed_by_server(&mut client).await);
        wait_until(|| engine.session_count() == 0).await;

        assert!(!engine.send_to(id, json!(1)));
        assert!(!engine.close_session(id));
        assert!(matches!(
            engine.try_send_to(id, json!(1)),
            Err(Error::SessionNotFound { .. })
        ));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_all_sessions() {
        let engine = started(Engine::builder()).await;
        let mut clients = vec![connect(&engine).await, connect(&engine).await];
        wait_until(|| engine.session_count() == 2).await;

        engine.stop().await;

        for client in &mut clients {
            assert!(closed_by_server(client).await);
        }
        wait_until(|| engine.session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_client_disconnect_deregisters() {
        let engine = started(Engine::builder()).await;
        let mut client = connect(&engine).await;
        wait_until(|| engine.session_count() == 1).await;

        client.close(None).await.unwrap();
        wait_until(|| engine.session_count() == 0).await;

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_short_frame_reports_accepted_then_closed() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let engine = started(Engine::builder().handler(move |envelope| {
            let _ = tx.send(envelope.event);
        }))
        .await;

        let mut client = connect(&engine).await;
        client.send(Message::binary(vec![0x7b])).await.unwrap();

        assert_eq!(within(events.recv()).await, Some(SessionEvent::Accepted));
        assert_eq!(
            within(events.recv()).await,
            Some(SessionEvent::Closed {
                code: CLOSE_CODE_ERROR
            })
        );
        assert!(closed_by_server(&mut client).await);

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_remote_ip_from_forwarded_header() {
        let (tx, mut ips) = mpsc::unbounded_channel();
        let engine = started(Engine::builder().handler(move |envelope| {
            if envelope.event.is_accepted() {
                let _ = tx.send(envelope.session.remote_ip().to_owned());
            }
        }))
        .await;

        let mut request = format!("ws://127.0.0.1:{}/ws", engine.port())
            .into_client_request()
            .unwrap();
        request.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let _client = tokio_tungstenite::connect_async(request).await.unwrap();

        assert_eq!(within(ips.recv()).await.as_deref(), Some("203.0.113.7"));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_custom_path() {
        let engine = started(Engine::builder().path("/live").handler(echo)).await;

        let wrong = format!("ws://127.0.0.1:{}/ws", engine.port());
        assert!(tokio_tungstenite::connect_async(wrong).await.is_err());

        let right = format!("ws://127.0.0.1:{}/live", engine.port());
        let (mut client, _) = tokio_tungstenite::connect_async(right).await.unwrap();
        client.send(Message::binary(b"[1,2]".to_vec())).await.unwrap();
        assert_eq!(next_json(&mut client).await, json!([1, 2]));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_tls_echo_round_trip() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(certified.cert.pem().as_bytes()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file
            .write_all(certified.key_pair.serialize_pem().as_bytes())
            .unwrap();

        let engine = started(
            Engine::builder()
                .certs(cert_file.path(), key_file.path())
                .handler(echo),
        )
        .await;

        let mut roots = rustls::RootCertStore::empty();
        roots.add(certified.cert.der().clone()).unwrap();
        let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

        let tcp = TcpStream::connect(("127.0.0.1", engine.port())).await.unwrap();
        let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let tls = connector.connect(server_name, tcp).await.unwrap();

        let url = format!("wss://localhost:{}/ws", engine.port());
        let (mut client, _) = tokio_tungstenite::client_async(url, tls).await.unwrap();

        client
            .send(Message::binary(br#"{"secure":true}"#.to_vec()))
            .await
            .unwrap();

        let reply = loop {
            match within(client.next()).await.unwrap().unwrap() {
                Message::Binary(data) => break serde_json::from_slice::<Value>(&data).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        };
        assert_eq!(reply, json!({"secure": true}));

        engine.stop().await;
    }
}
