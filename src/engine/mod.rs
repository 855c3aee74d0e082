//! Session engine.
//!
//! This module provides the main entry point: an [`Engine`] accepts
//! WebSocket connections, runs one session per peer, and routes every
//! inbound message to a single application handler.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Engine`] | Listener + registry + codec + handler |
//! | [`EngineBuilder`] | Fluent configuration builder |
//! | [`EngineConfig`] | Serializable listener and registry settings |
//!
//! # Example
//!
//! ```no_run
//! use wsengine::{Engine, Result, SessionEvent};
//!
//! # async fn example() -> Result<()> {
//! let engine = Engine::builder()
//!     .port(9999)
//!     .handler(|envelope| {
//!         if let SessionEvent::Message(value) = envelope.event {
//!             envelope.session.send(value);
//!         }
//!     })
//!     .build()?;
//!
//! engine.start().await?;
//! engine.broadcast(&serde_json::json!({"event": "hello"}));
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for engine configuration.
pub mod builder;

/// Engine configuration.
pub mod config;

/// Core engine implementation.
pub mod core;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::EngineBuilder;
pub use config::{DEFAULT_PATH, EngineConfig};
pub use core::Engine;
