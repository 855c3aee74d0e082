//! Frame codecs.
//!
//! A [`Codec`] turns one complete binary WebSocket frame into an application
//! value and back. Sessions call [`Codec::decode`] for every inbound binary
//! frame of at least [`MIN_FRAME_LEN`] bytes and [`Codec::encode`] before every
//! outbound write.
//!
//! | Codec | Message type | Wire format |
//! |-------|--------------|-------------|
//! | [`JsonCodec`] | [`serde_json::Value`] | UTF-8 JSON document |
//! | [`RawCodec`] | `Vec<u8>` | bytes as-is |

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;

use crate::error::Result;

// ============================================================================
// Constants
// ============================================================================

/// Smallest binary frame the receive loop hands to a decoder.
pub const MIN_FRAME_LEN: usize = 2;

// ============================================================================
// Codec
// ============================================================================

/// Encode/decode pair shared by every session of an engine.
///
/// Implementations must be cheap to call concurrently; one codec instance is
/// shared by all sessions. A decode error ends the session that received the
/// frame. An encode error drops that one message and the session carries on.
pub trait Codec: Send + Sync + 'static {
    /// Application-level message type.
    ///
    /// `Clone` is required so one message can be broadcast to many sessions.
    type Message: Clone + Send + Sync + 'static;

    /// Decodes one binary frame.
    ///
    /// # Errors
    ///
    /// Any error is terminal for the session that received the frame.
    fn decode(&self, data: &[u8]) -> Result<Self::Message>;

    /// Encodes one outbound message.
    ///
    /// # Errors
    ///
    /// The message is logged and skipped.
    fn encode(&self, message: &Self::Message) -> Result<Vec<u8>>;
}

// ============================================================================
// JsonCodec
// ============================================================================

/// JSON codec over [`serde_json::Value`].
///
/// The engine's default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Message = Value;

    #[inline]
    fn decode(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }

    #[inline]
    fn encode(&self, message: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }
}

// ============================================================================
// RawCodec
// ============================================================================

/// Pass-through codec: frames are delivered and written as raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Message = Vec<u8>;

    #[inline]
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    #[inline]
    fn encode(&self, message: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(message.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================
