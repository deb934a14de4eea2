//! [`Memory`] — the per-request container a node's behavior runs against
//! (spec §3).
//!
//! A memory carries a scope, an input value typed per memory kind, an
//! immutable set of references to ancestor memories, and a storage. The input
//! is type-erased (`Arc<dyn Any + Send + Sync>`) so that [`crate::call::GraphCall`]
//! can hold memories of different kinds uniformly; nodes bound to a given
//! memory kind downcast via [`Memory::input`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::reply::MemoryId;
use crate::scope::MemoryScope;
use crate::store::MemoryStore;

/// A user-declared tag identifying which kind of memory a node is statically
/// bound to (spec §3 "memory kind"). Two memories of the same kind are still
/// independent memoization scopes; the kind only constrains which nodes may
/// run against which memory and which input type they expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryKindId(pub &'static str);

/// A per-request container: input, storage, scope, and non-owning references
/// to ancestor memories (spec §3).
pub struct Memory {
    pub id: MemoryId,
    pub kind: MemoryKindId,
    input: Arc<dyn Any + Send + Sync>,
    pub scope: Arc<MemoryScope>,
    ancestors: HashMap<MemoryKindId, std::sync::Weak<Memory>>,
    pub storage: MemoryStore,
}

impl Memory {
    pub fn new(
        id: MemoryId,
        kind: MemoryKindId,
        input: Arc<dyn Any + Send + Sync>,
        scope: Arc<MemoryScope>,
        ancestors: HashMap<MemoryKindId, std::sync::Weak<Memory>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            input,
            scope,
            ancestors,
            storage: MemoryStore::new(),
        })
    }

    /// Downcast this memory's input to the type the calling node expects. A
    /// mismatch is a graph-construction bug (a node bound to the wrong memory
    /// kind), not a runtime data error, so it panics rather than returning an
    /// error, mirroring how `Reply::get`'s downcast treats identity mismatches.
    pub fn input<T: Send + Sync + 'static>(&self) -> &T {
        self.input
            .downcast_ref::<T>()
            .expect("memory input type mismatch: node bound to the wrong memory kind")
    }

    /// Look up a named ancestor memory (spec §4.4 "ancestor access").
    pub fn ancestor(&self, kind: MemoryKindId) -> Option<Arc<Memory>> {
        self.ancestors.get(&kind).and_then(|weak| weak.upgrade())
    }
}

/// Factory invoked by the engine to construct a `new-memory` dependency's
/// memory from the current memory and the edge's declared kind (spec §4.4,
/// §6 `MemoryFactory`). Ownership of the produced memory transfers to the
/// engine immediately — behaviors must not retain the input `Arc` and reuse it
/// across memories.
pub trait MemoryFactory: Send + Sync {
    fn create(
        &self,
        current: &Arc<Memory>,
        scope: Arc<MemoryScope>,
        id: MemoryId,
    ) -> Arc<Memory>;
}

impl<F> MemoryFactory for F
where
    F: Fn(&Arc<Memory>, Arc<MemoryScope>, MemoryId) -> Arc<Memory> + Send + Sync,
{
    fn create(&self, current: &Arc<Memory>, scope: Arc<MemoryScope>, id: MemoryId) -> Arc<Memory> {
        self(current, scope, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::MemoryScope;

    #[test]
    fn ancestor_lookup_is_non_owning() {
        let scope = MemoryScope::root();
        let root = Memory::new(
            MemoryId(0),
            MemoryKindId("root"),
            Arc::new(()),
            scope.clone(),
            HashMap::new(),
        );
        let mut ancestors = HashMap::new();
        ancestors.insert(MemoryKindId("root"), Arc::downgrade(&root));
        let child = Memory::new(MemoryId(1), MemoryKindId("child"), Arc::new(5i32), scope, ancestors);
        assert!(child.ancestor(MemoryKindId("root")).is_some());
        assert_eq!(*child.input::<i32>(), 5);
    }
}
