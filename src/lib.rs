//! wsengine - Persistent-connection WebSocket session engine.
//!
//! This library accepts WebSocket connections, runs each one as an
//! independent session with its own receive and send tasks, and routes all
//! inbound traffic to a single application handler.
//!
//! # Architecture
//!
//! - **Listener**: TCP (optionally TLS) accept loop, one upgrade path,
//!   client IP resolved from proxy headers
//! - **Session**: receive loop, batched send loop, join barrier
//! - **Registry**: process-unique ids, addressed send and broadcast
//!
//! Key design principles:
//!
//! - Each session owns its connection and outbound queue; nothing else
//!   touches them
//! - `send()` never blocks; the send loop writes whole backlogs per wakeup
//! - Errors and panics in one session never reach another
//! - The handler sees `Accepted`, then messages in arrival order, then `Closed`
//!
//! # Quick Start
//!
//! ```no_run
//! use wsengine::{Engine, Result, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let engine = Engine::builder()
//!         .addr("127.0.0.1")
//!         .port(9999)
//!         .handler(|envelope| match envelope.event {
//!             SessionEvent::Accepted => println!("session {} open", envelope.session.id()),
//!             SessionEvent::Message(value) => envelope.session.send(value),
//!             SessionEvent::Closed { code } => println!("closed with {code}"),
//!         })
//!         .build()?;
//!
//!     engine.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     engine.stop().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`engine`] | [`Engine`], builder and configuration |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | [`SessionId`] |
//! | [`protocol`] | Codecs and handler-facing events |
//! | [`transport`] | Listener, sessions, outbound queue, registry |

// ============================================================================
// Modules
// ============================================================================

/// Engine entry point and configuration.
///
/// Use [`Engine::builder()`] to create a configured engine.
pub mod engine;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe session identifiers.
pub mod identifiers;

/// Frame codecs and handler events.
pub mod protocol;

/// WebSocket transport layer.
///
/// Listener, per-connection sessions and the session registry.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Engine types
pub use engine::{Engine, EngineBuilder, EngineConfig};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::SessionId;

// Protocol types
pub use protocol::{CLOSE_CODE_ERROR, Codec, Envelope, JsonCodec, MessageHandler, RawCodec, SessionEvent};

// Transport types
pub use transport::{SentHook, Session, SessionManager, SessionRegistry, WsSession};
