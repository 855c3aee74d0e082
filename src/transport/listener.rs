//! Connection listener.
//!
//! Binds a TCP socket, optionally wraps accepted connections in TLS, and
//! upgrades requests on the configured path to WebSocket.
//!
//! # Connection Flow
//!
//! 1. `accept()` on the bound socket
//! 2. TLS handshake when certificate and key are configured
//! 3. WebSocket upgrade; other paths get `404 Not Found`
//! 4. Client IP resolved from proxy headers, falling back to the peer address
//! 5. [`ConnOpenHandler`] receives the upgraded stream and the client IP
//!
//! Steps 2 to 5 run on a task per connection, so a slow handshake never
//! stalls the accept loop.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tracing::{Instrument, Span, debug, info, warn};

use crate::error::{Error, Result};

use super::tls;
use super::{BoxedTransport, WsStream};

// ============================================================================
// Constants
// ============================================================================

/// Address bound when none is configured.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Upper bound on TLS plus WebSocket handshake time.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept()` (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

// ============================================================================
// Types
// ============================================================================

/// Receives each upgraded connection together with the client IP.
pub type ConnOpenHandler = Arc<dyn Fn(WsStream, String) + Send + Sync>;

// ============================================================================
// Listener
// ============================================================================

/// Accepts and upgrades WebSocket connections.
pub struct Listener {
    /// Bind address; empty means all interfaces.
    addr: String,
    /// Configured port, 0 for an OS-assigned one.
    port: u16,
    /// Upgrade path.
    path: Arc<str>,
    /// PEM certificate and key; TLS is enabled when set.
    tls: Option<(PathBuf, PathBuf)>,
    /// Address actually bound, set once `start` succeeds.
    local_addr: Mutex<Option<SocketAddr>>,
    /// Stops the accept loop.
    shutdown: Arc<Notify>,
    /// Accept loop task.
    task: Mutex<Option<JoinHandle<()>>>,
    /// Span the accept loop and handshakes run in.
    span: Span,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("tls", &self.tls.is_some())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Creates a listener for `addr:port`, upgrading requests on `path`.
    #[must_use]
    pub fn new(addr: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        let path: String = path.into();

        Self {
            addr: addr.into(),
            port,
            path: Arc::from(path),
            tls: None,
            local_addr: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
            span: Span::none(),
        }
    }

    /// Enables TLS with the given PEM certificate chain and private key.
    #[must_use]
    pub fn with_tls(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.tls = Some((cert_file.into(), key_file.into()));
        self
    }

    /// Sets the span the accept loop runs in.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Returns the configured bind address, [`DEFAULT_BIND_ADDR`] if empty.
    #[inline]
    #[must_use]
    pub fn addr(&self) -> &str {
        if self.addr.is_empty() {
            DEFAULT_BIND_ADDR
        } else {
            &self.addr
        }
    }

    /// Returns the bound port, or the configured one before `start`.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr().map_or(self.port, |addr| addr.port())
    }

    /// Returns the upgrade path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns `true` if TLS is configured.
    #[inline]
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Returns the bound address once started.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Returns `true` while the accept loop is running.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Binds the socket and spawns the accept loop.
    ///
    /// Returns once the socket is bound; connections are handed to
    /// `on_open` from then on.
    ///
    /// # Errors
    ///
    /// - [`Error::Tls`] / [`Error::Rustls`] if TLS material cannot be loaded
    /// - [`Error::Io`] if binding fails
    pub async fn start(&self, on_open: ConnOpenHandler) -> Result<()> {
        let acceptor = match &self.tls {
            Some((cert_file, key_file)) => Some(tls::build_acceptor(cert_file, key_file)?),
            None => None,
        };

        let listener = TcpListener::bind((self.addr(), self.port)).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        info!(
            %local_addr,
            path = %self.path,
            tls = acceptor.is_some(),
            "WebSocket listener bound"
        );

        let accept = AcceptLoop {
            listener,
            acceptor,
            path: Arc::clone(&self.path),
            on_open,
            shutdown: Arc::clone(&self.shutdown),
            span: self.span.clone(),
        };

        let task = tokio::spawn(accept.run().instrument(self.span.clone()));
        *self.task.lock() = Some(task);

        Ok(())
    }

    /// Stops accepting connections and waits for the accept loop to exit.
    ///
    /// Connections already being upgraded still complete. Idempotent.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };

        self.shutdown.notify_one();

        if let Err(e) = task.await {
            warn!(error = %e, "Accept loop failed");
        }

        debug!(port = self.port(), "WebSocket listener stopped");
    }
}

// ============================================================================
// AcceptLoop
// ============================================================================

/// State moved into the accept task.
struct AcceptLoop {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    path: Arc<str>,
    on_open: ConnOpenHandler,
    shutdown: Arc<Notify>,
    span: Span,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                () = self.shutdown.notified() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (tcp, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            debug!(?peer, "TCP connection accepted");

            let handshake = Handshake {
                acceptor: self.acceptor.clone(),
                path: Arc::clone(&self.path),
                on_open: Arc::clone(&self.on_open),
            };

            tokio::spawn(
                async move {
                    match timeout(HANDSHAKE_TIMEOUT, handshake.run(tcp, peer)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(?peer, error = %e, "Upgrade failed"),
                        Err(_) => debug!(?peer, "Upgrade timed out"),
                    }
                }
                .instrument(self.span.clone()),
            );
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Per-connection upgrade.
struct Handshake {
    acceptor: Option<TlsAcceptor>,
    path: Arc<str>,
    on_open: ConnOpenHandler,
}

impl Handshake {
    async fn run(self, tcp: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(?peer, error = %e, "set_nodelay failed");
        }

        let transport: BoxedTransport = match &self.acceptor {
            Some(acceptor) => Box::new(
                acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| Error::connection(format!("TLS handshake failed: {e}")))?,
            ),
            None => Box::new(tcp),
        };

        let client_ip = Arc::new(Mutex::new(peer.ip().to_string()));
        let captured = Arc::clone(&client_ip);
        let path = Arc::clone(&self.path);

        let stream = tokio_tungstenite::accept_hdr_async(
            transport,
            move |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
                if request.uri().path() != &*path {
                    return Err(not_found());
                }
                *captured.lock() = resolve_client_ip(request.headers(), peer.ip());
                Ok(response)
            },
        )
        .await
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        let client_ip = client_ip.lock().clone();
        debug!(?peer, %client_ip, "WebSocket connection established");

        (self.on_open)(stream, client_ip);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Resolves the client IP of an upgrade request.
///
/// Order: first `X-Forwarded-For` entry, then `X-Real-Ip`, then the TCP peer.
#[must_use]
pub fn resolve_client_ip(headers: &HeaderMap, peer: IpAddr) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    };

    let forwarded = header(FORWARDED_FOR)
        .split(',')
        .next()
        .unwrap_or_default()
        .trim();
    if !forwarded.is_empty() {
        return forwarded.to_owned();
    }

    let real_ip = header(REAL_IP).trim();
    if !real_ip.is_empty() {
        return real_ip.to_owned();
    }

    peer.to_string()
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Not Found".to_owned()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

// ============================================================================
// Tests
// ============================================================================
