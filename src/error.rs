//! Error types for the session engine.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use wsengine::{Engine, Result};
//!
//! async fn example() -> Result<()> {
//!     let engine = Engine::builder().port(9999).build()?;
//!     engine.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::Tls`] |
//! | Lifecycle | [`Error::AlreadyStarted`], [`Error::EngineClosed`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Framing | [`Error::FrameTooShort`], [`Error::UnexpectedFrame`], [`Error::Codec`] |
//! | Registry | [`Error::SessionNotFound`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Rustls`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::SessionId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Per-session errors never leave the session that produced them; they are
/// logged and turned into a `Closed` lifecycle event. The variants here are
/// what callers of the engine API and the codec layer see.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when engine configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// TLS setup error.
    ///
    /// Returned when certificate or key material cannot be loaded.
    #[error("TLS error: {message}")]
    Tls {
        /// Description of the TLS error.
        message: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// `start()` was called on an engine that is already running.
    #[error("Engine already started")]
    AlreadyStarted,

    /// The engine has been stopped and cannot be restarted.
    #[error("Engine closed")]
    EngineClosed,

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection setup or upgrade failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection closed by the peer or locally.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Framing Errors
    // ========================================================================
    /// Binary frame shorter than the minimum frame size.
    #[error("Frame too short: {len} bytes")]
    FrameTooShort {
        /// Length of the rejected frame.
        len: usize,
    },

    /// Non-binary data frame received.
    #[error("Unexpected {kind} frame")]
    UnexpectedFrame {
        /// Kind of the rejected frame.
        kind: &'static str,
    },

    /// Encode or decode failure reported by a codec.
    #[error("Codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    // ========================================================================
    // Registry Errors
    // ========================================================================
    /// No session registered under the id.
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// The missing session id.
        session_id: SessionId,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// rustls configuration error.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a TLS error.
    #[inline]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a frame-too-short error.
    #[inline]
    pub fn frame_too_short(len: usize) -> Self {
        Self::FrameTooShort { len }
    }

    /// Creates an unexpected frame error.
    #[inline]
    pub fn unexpected_frame(kind: &'static str) -> Self {
        Self::UnexpectedFrame { kind }
    }

    /// Creates a codec error.
    #[inline]
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a session not found error.
    #[inline]
    pub fn session_not_found(session_id: SessionId) -> Self {
        Self::SessionNotFound { session_id }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection-level error.
    ///
    /// These are the ordinary ways a session ends and are logged at debug.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::WebSocket(_) | Self::Io(_)
        )
    }

    /// Returns `true` if the peer sent something the codec layer rejected.
    #[inline]
    #[must_use]
    pub fn is_codec_error(&self) -> bool {
        matches!(
            self,
            Self::FrameTooShort { .. }
                | Self::UnexpectedFrame { .. }
                | Self::Codec { .. }
                | Self::Json(_)
        )
    }

    /// Returns `true` if this is an engine lifecycle error.
    #[inline]
    #[must_use]
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(self, Self::AlreadyStarted | Self::EngineClosed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("upgrade refused");
        assert_eq!(err.to_string(), "Connection failed: upgrade refused");
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("path must start with '/'");
        assert_eq!(
            err.to_string(),
            "Configuration error: path must start with '/'"
        );
    }

    #[test]
    fn test_frame_errors() {
        assert_eq!(Error::frame_too_short(1).to_string(), "Frame too short: 1 bytes");
        assert_eq!(
            Error::unexpected_frame("text").to_string(),
            "Unexpected text frame"
        );
    }

    #[test]
    fn test_session_not_found() {
        let err = Error::session_not_found(SessionId::new(42));
        assert_eq!(err.to_string(), "Session not found: 42");
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("test").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(!Error::codec("bad").is_connection_error());
        assert!(!Error::config("test").is_connection_error());
    }

    #[test]
    fn test_is_codec_error() {
        assert!(Error::frame_too_short(0).is_codec_error());
        assert!(Error::unexpected_frame("text").is_codec_error());
        assert!(Error::codec("bad").is_codec_error());
        assert!(!Error::ConnectionClosed.is_codec_error());
    }

    #[test]
    fn test_is_lifecycle_error() {
        assert!(Error::AlreadyStarted.is_lifecycle_error());
        assert!(Error::EngineClosed.is_lifecycle_error());
        assert!(!Error::ConnectionClosed.is_lifecycle_error());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::AddrInUse, "address in use");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.is_codec_error());
    }
}
