//! Handler-facing session events.
//!
//! Every session delivers its traffic to the single application handler as
//! [`Envelope`]s, in this order:
//!
//! 1. exactly one [`SessionEvent::Accepted`]
//! 2. zero or more [`SessionEvent::Message`] in frame-arrival order
//! 3. exactly one [`SessionEvent::Closed`]

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::transport::Session;

use super::codec::Codec;

// ============================================================================
// Constants
// ============================================================================

/// Close code reported when a session ends on a read, decode or peer error.
pub const CLOSE_CODE_ERROR: i32 = -1;

// ============================================================================
// Types
// ============================================================================

/// Application message handler.
///
/// Called from the session's receive task; a slow handler delays only its
/// own session.
pub type MessageHandler<C> = Arc<dyn Fn(Envelope<C>) + Send + Sync>;

// ============================================================================
// SessionEvent
// ============================================================================

/// A decoded payload or a lifecycle marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent<M> {
    /// The session has been registered and started.
    Accepted,
    /// A decoded inbound frame.
    Message(M),
    /// The session is closing; no further events follow.
    Closed {
        /// Close reason, [`CLOSE_CODE_ERROR`] for read/decode failures.
        code: i32,
    },
}

impl<M> SessionEvent<M> {
    /// Returns `true` for the `Accepted` marker.
    #[inline]
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Returns `true` for the `Closed` marker.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Returns the payload of a `Message` event.
    #[inline]
    #[must_use]
    pub fn message(&self) -> Option<&M> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }

    /// Consumes the event, returning the payload of a `Message` event.
    #[inline]
    #[must_use]
    pub fn into_message(self) -> Option<M> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A session paired with one of its events.
pub struct Envelope<C: Codec> {
    /// The session the event belongs to.
    pub session: Arc<Session<C>>,
    /// The event itself.
    pub event: SessionEvent<C::Message>,
}

impl<C: Codec> Envelope<C> {
    /// Creates an envelope.
    #[inline]
    pub fn new(session: Arc<Session<C>>, event: SessionEvent<C::Message>) -> Self {
        Self { session, event }
    }
}

impl<C: Codec> fmt::Debug for Envelope<C>
where
    C::Message: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("session_id", &self.session.id())
            .field("event", &self.event)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
