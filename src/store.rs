//! [`MemoryStore`] — the per-memory-instance memoization device (spec §3, §4.2).
//!
//! `get_or_create` is the single memoization primitive in the engine: it is
//! linearizable, insertion-once, and never evicts during a call. Memoization is
//! per-memory-*instance*, not per-memory-*kind* — distinct memories of the same
//! kind hold independent stores (spec §4.2), which is how iteration yields
//! independent per-element calls while graph-wide reuse of a shared dependency
//! stays single-shot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::reply::{NodeId, ReplyCell, ReplyKey};

/// A thread-safe mapping from node identity to reply, scoped to one memory
/// instance.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<NodeId, Arc<ReplyCell>>>,
}

/// The result of a `get_or_create` call: whether this call won the race to
/// create the entry (and must therefore run the node's pipeline) or whether an
/// existing entry was returned (a cache hit).
pub enum GetOrCreate {
    Existing(Arc<ReplyCell>),
    Created(Arc<ReplyCell>),
}

impl GetOrCreate {
    pub fn cell(&self) -> &Arc<ReplyCell> {
        match self {
            GetOrCreate::Existing(c) | GetOrCreate::Created(c) => c,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, GetOrCreate::Created(_))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent check-in: either returns the existing reply or atomically
    /// installs a new one, guaranteeing the creating caller is the unique one
    /// that will run the pipeline (spec §3, invariant §8.1 "at-most-once").
    pub fn get_or_create(
        &self,
        node: NodeId,
        memory: crate::reply::MemoryId,
        role: Arc<str>,
        reply_cancel: Arc<crate::scope::CancelSignal>,
    ) -> GetOrCreate {
        let mut guard = self.entries.lock().unwrap();
        if let Some(existing) = guard.get(&node) {
            return GetOrCreate::Existing(existing.clone());
        }
        let cell = ReplyCell::new(ReplyKey { node, memory }, role, reply_cancel);
        guard.insert(node, cell.clone());
        GetOrCreate::Created(cell)
    }

    pub fn get(&self, node: NodeId) -> Option<Arc<ReplyCell>> {
        self.entries.lock().unwrap().get(&node).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::MemoryId;
    use crate::scope::CancelSignal;

    #[test]
    fn concurrent_get_or_create_is_linearizable_in_effect() {
        let store = MemoryStore::new();
        let node = NodeId(7);
        let mem = MemoryId(1);
        let first = store.get_or_create(node, mem, Arc::from("n"), CancelSignal::new());
        assert!(first.is_new());
        let second = store.get_or_create(node, mem, Arc::from("n"), CancelSignal::new());
        assert!(!second.is_new());
        assert!(Arc::ptr_eq(first.cell(), second.cell()));
    }
}
