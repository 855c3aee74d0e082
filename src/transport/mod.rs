//! WebSocket transport layer.
//!
//! Accepts connections, upgrades them, and runs one [`Session`] per peer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  upgraded stream  ┌──────────────┐  add/remove  ┌──────────────────┐
//! │   Listener   │ ────────────────► │   Session    │ ───────────► │ SessionRegistry  │
//! │ (tcp or tls) │   + client IP     │ recv + send  │              │  id → session    │
//! └──────────────┘                   └──────────────┘              └──────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `queue` | Batched outbound queue with stop marker |
//! | `session` | Per-connection tasks and lifecycle |
//! | `registry` | Id assignment and live-session map |
//! | `listener` | TCP accept loop and upgrade |
//! | `tls` | Certificate loading and server TLS config |

// ============================================================================
// Imports
// ============================================================================

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;

// ============================================================================
// Submodules
// ============================================================================

/// Batched outbound queue.
pub mod queue;

/// Per-connection session.
pub mod session;

/// Live session registry.
pub mod registry;

/// Connection listener.
pub mod listener;

/// TLS configuration.
pub mod tls;

// ============================================================================
// Types
// ============================================================================

/// Byte stream a session can run over: plain TCP, TLS, or an in-memory pipe.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;

/// Upgraded WebSocket connection as handed to sessions.
pub type WsStream = WebSocketStream<BoxedTransport>;

// ============================================================================
// Re-exports
// ============================================================================

pub use listener::{ConnOpenHandler, Listener};
pub use queue::{Outbound, OutboundQueue};
pub use registry::{SessionManager, SessionRegistry};
pub use session::{SentHook, Session, SessionContext, SessionHook, WsSession};
