//! Live session registry.
//!
//! Maps [`SessionId`] to sessions for addressed send and broadcast.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           SessionRegistry               │
//! │   seed: AtomicU64 (never reused)        │
//! │  ┌─────────────────────────────────┐    │
//! │  │ SessionId=1001 → Session        │    │
//! │  │ SessionId=1002 → Session        │    │
//! │  │ SessionId=1004 → Session        │    │
//! │  └─────────────────────────────────┘    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Session tasks add and remove entries concurrently; callers never need
//! their own locking. Iteration works on a snapshot, so visitors may call
//! back into the registry.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::identifiers::SessionId;

use super::session::WsSession;

// ============================================================================
// SessionManager
// ============================================================================

/// Registry operations used by the engine.
pub trait SessionManager: Send + Sync {
    /// Session type stored in the registry.
    type Session: WsSession;

    /// Assigns a fresh id to the session and stores it.
    fn add(&self, session: Arc<Self::Session>) -> SessionId;

    /// Removes the session stored under the session's own id, if any.
    fn remove(&self, session: &Self::Session);

    /// Looks up a session.
    fn get(&self, id: SessionId) -> Option<Arc<Self::Session>>;

    /// Visits a snapshot of the registered sessions until the visitor
    /// returns `false`.
    fn for_each<F>(&self, visitor: F)
    where
        F: FnMut(&Arc<Self::Session>) -> bool;

    /// Number of registered sessions.
    fn count(&self) -> usize;

    /// Starts closing every registered session. Does not wait.
    fn close_all(&self);

    /// Moves the id counter forward; the next id is at least `seed + 1`.
    ///
    /// A seed below the last issued id is ignored, so ids stay unique.
    fn set_id_seed(&self, seed: u64);
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// Concurrent map of live sessions.
pub struct SessionRegistry<S> {
    /// Last id handed out.
    seed: AtomicU64,
    /// Registered sessions by id.
    sessions: RwLock<FxHashMap<SessionId, Arc<S>>>,
}

impl<S> fmt::Debug for SessionRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("seed", &self.seed.load(Ordering::Relaxed))
            .field("count", &self.sessions.read().len())
            .finish()
    }
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl<S> SessionRegistry<S> {
    /// Creates an empty registry whose first id is 1.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry whose first id is `seed + 1`.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed: AtomicU64::new(seed),
            sessions: RwLock::new(FxHashMap::default()),
        }
    }

    /// Returns the registered ids, in no particular order.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }

    fn snapshot(&self) -> Vec<Arc<S>> {
        self.sessions.read().values().cloned().collect()
    }
}

impl<S: WsSession> SessionManager for SessionRegistry<S> {
    type Session = S;

    fn add(&self, session: Arc<S>) -> SessionId {
        let id = SessionId::new(self.seed.fetch_add(1, Ordering::AcqRel) + 1);
        session.assign_id(id);

        if self.sessions.write().insert(id, session).is_some() {
            warn!(session_id = %id, "Session id collision, previous session replaced");
        }

        debug!(session_id = %id, "Session registered");
        id
    }

    fn remove(&self, session: &S) {
        let id = session.id();
        let mut sessions = self.sessions.write();

        let owned = sessions
            .get(&id)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), session));
        if owned {
            sessions.remove(&id);
            debug!(session_id = %id, "Session deregistered");
        }
    }

    fn get(&self, id: SessionId) -> Option<Arc<S>> {
        self.sessions.read().get(&id).cloned()
    }

    fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<S>) -> bool,
    {
        for session in self.snapshot() {
            if !visitor(&session) {
                break;
            }
        }
    }

    fn count(&self) -> usize {
        self.sessions.read().len()
    }

    fn close_all(&self) {
        let sessions = self.snapshot();
        debug!(count = sessions.len(), "Closing all sessions");

        for session in sessions {
            session.close();
        }
    }

    fn set_id_seed(&self, seed: u64) {
        let previous = self.seed.fetch_max(seed, Ordering::AcqRel);
        if previous > seed {
            warn!(seed, last_id = previous, "Id seed below last issued id, ignored");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
