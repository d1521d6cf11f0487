//! The set of live pool connections.
//!
//! The pool itself is a plain map; the supervisor serializes every
//! mutation (and the reconnect-timer decision that depends on pool size)
//! under its own lock, so nothing here needs interior mutability.

use std::collections::HashMap;
use tokio::sync::mpsc;

/// Handle to one pooled connection. A connection joins the pool when its
/// transport connect succeeds and leaves on close or error.
pub(crate) struct PoolMember {
    /// Signals the connection task to tear down during `close()`.
    pub(crate) shutdown: mpsc::Sender<()>,
}

#[derive(Default)]
pub(crate) struct Pool {
    members: HashMap<u64, PoolMember>,
}

impl Pool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, id: u64, member: PoolMember) {
        self.members.insert(id, member);
    }

    /// Idempotent; returns whether the connection was still pooled.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.members.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Snapshot of the shutdown handles, for `close()` to iterate without
    /// holding the supervisor lock across awaits.
    pub(crate) fn snapshot(&self) -> Vec<(u64, mpsc::Sender<()>)> {
        self.members
            .iter()
            .map(|(id, m)| (*id, m.shutdown.clone()))
            .collect()
    }
}
