//! Message-level protocol types.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Codec`] | Frame encode/decode contract |
//! | [`JsonCodec`] | Default JSON codec |
//! | [`RawCodec`] | Pass-through bytes codec |
//! | [`SessionEvent`] | Payload or lifecycle marker |
//! | [`Envelope`] | Session + event, as seen by the handler |

// ============================================================================
// Submodules
// ============================================================================

/// Frame codecs.
pub mod codec;

/// Handler-facing events.
pub mod envelope;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{Codec, JsonCodec, MIN_FRAME_LEN, RawCodec};
pub use envelope::{CLOSE_CODE_ERROR, Envelope, MessageHandler, SessionEvent};
