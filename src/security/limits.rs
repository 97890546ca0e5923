//! Concurrent connection cap.
//!
//! `try_acquire` hands out a `ConnectionGuard` whose `Drop` releases the
//! slot, so a connection task cannot leak its admission.

use crate::error::SecurityError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

struct TrackerInner {
    active: AtomicUsize,
    rejected: AtomicUsize,
    max_connections: usize,
}

#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                active: AtomicUsize::new(0),
                rejected: AtomicUsize::new(0),
                max_connections,
            }),
        }
    }

    /// Whether a new connection would currently be admitted
    pub fn has_capacity(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst) < self.inner.max_connections
    }

    pub fn try_acquire(&self, client_id: &str) -> Result<ConnectionGuard, SecurityError> {
        let inner = &self.inner;

        // Optimistic increment, rolled back past the cap
        let previous = inner.active.fetch_add(1, Ordering::SeqCst);
        if previous >= inner.max_connections {
            inner.active.fetch_sub(1, Ordering::SeqCst);
            inner.rejected.fetch_add(1, Ordering::SeqCst);
            warn!(
                "Rejecting connection {}: {} connections active",
                client_id, previous
            );
            return Err(SecurityError::ConnectionLimit {
                max: inner.max_connections,
            });
        }

        Ok(ConnectionGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.inner.rejected.load(Ordering::SeqCst)
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }
}

/// Holds one admitted connection slot
pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}
