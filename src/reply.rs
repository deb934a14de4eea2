//! [`Reply`] — the future-like handle for one invocation of one node with one
//! memory (spec §3).
//!
//! A reply's identity is `(node, memory-instance)`. Internally the completion
//! value is type-erased (`Arc<dyn Any + Send + Sync>`) so that a single
//! concrete [`crate::store::MemoryStore`] can hold replies for nodes with
//! different output types; the typed [`Reply<V>`] wrapper downcasts on read.
//! This mirrors the teacher crate's pattern of keeping one concrete storage
//! type and pushing genericity to the edges (`store.rs`'s `Cache<K, V>` does
//! the inverse — monomorphic storage per cache instance — but the shape of
//! "one storage, typed accessors" is the same idea).

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::FailureChain;
use crate::scope::CancelSignal;

/// Stable identity for a node within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Stable identity for one memory instance within a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryId(pub u64);

/// `(node, memory-instance)` — the identity of a reply (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyKey {
    pub node: NodeId,
    pub memory: MemoryId,
}

/// The terminal shape of a completed reply, type-erased.
pub(crate) enum Outcome {
    Success(Arc<dyn Any + Send + Sync>),
    Failed(FailureChain),
    Cancelled,
}

impl Outcome {
    pub(crate) fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

enum CellState {
    Pending,
    Done(Outcome),
}

/// Type-erased, shared reply storage. Exactly one of these exists per
/// `(node, memory-instance)` for the lifetime of the owning memory (spec §3:
/// "once non-pending, the state is immutable; exactly one completion event is
/// published").
/// Public only so [`crate::node::NodeDyn::invoke_dyn`] can name it in its
/// return type; every field and constructor stays crate-private, so this is
/// an opaque handle outside the crate.
pub struct ReplyCell {
    pub key: ReplyKey,
    pub role: Arc<str>,
    state: Mutex<CellState>,
    notify: Notify,
    /// The reply-tier cancellation signal (spec §4.3 tier 3).
    pub reply_cancel: Arc<CancelSignal>,
    /// How many distinct consumers have registered interest via the device.
    /// Used for the conservative "provably unique consumer" proof behind
    /// `ignore` (spec §4.3, §8.5).
    registered_consumers: AtomicUsize,
    ignored_consumers: AtomicUsize,
    /// Set once any `Reply::get` call has observed this cell's outcome. Used
    /// by [`crate::call::GraphCall::weakly_close`] / `abandon` to tell apart a
    /// failure some consumer actually saw from one nobody ever retrieved,
    /// which becomes an unhandled exception (spec §4.1, §9).
    read: AtomicBool,
    /// This invocation's own direct dependency replies, recorded just before
    /// completion so a consumer with `node-for-all` dependency-lifetime can
    /// walk the transitive closure by following each dependency's own
    /// dependencies in turn (spec §4.1 "node-for-all").
    dependencies: Mutex<Vec<Arc<ReplyCell>>>,
}

impl ReplyCell {
    pub(crate) fn new(key: ReplyKey, role: Arc<str>, reply_cancel: Arc<CancelSignal>) -> Arc<Self> {
        Arc::new(Self {
            key,
            role,
            state: Mutex::new(CellState::Pending),
            notify: Notify::new(),
            reply_cancel,
            registered_consumers: AtomicUsize::new(0),
            ignored_consumers: AtomicUsize::new(0),
            read: AtomicBool::new(false),
            dependencies: Mutex::new(Vec::new()),
        })
    }

    /// Record this invocation's direct dependencies. Must be called before
    /// [`ReplyCell::complete`] so that any consumer observing completion via
    /// `await_outcome` also sees a fully-populated dependency list.
    pub(crate) fn set_dependencies(&self, deps: Vec<Arc<ReplyCell>>) {
        *self.dependencies.lock().unwrap() = deps;
    }

    pub(crate) fn dependencies(&self) -> Vec<Arc<ReplyCell>> {
        self.dependencies.lock().unwrap().clone()
    }

    pub(crate) fn complete(&self, outcome: Outcome) {
        let mut guard = self.state.lock().unwrap();
        if matches!(&*guard, CellState::Pending) {
            *guard = CellState::Done(outcome);
            drop(guard);
            self.notify.notify_waiters();
        }
        // A second completion attempt is a logic error in the executor, but we
        // stay defensive rather than panic: the first write wins (spec §3
        // "exactly one completion event is published").
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), CellState::Done(_))
    }

    pub(crate) async fn await_outcome(&self) {
        loop {
            if self.is_done() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }

    /// Register a new consumer of this reply. Returns the registration count
    /// observed after registering.
    pub(crate) fn register_consumer(&self) -> usize {
        self.registered_consumers.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a consumer ignoring this reply. Triggers the reply-cancel signal
    /// only when the registration count is (and was always) exactly one — the
    /// conservative, minimal proof of uniqueness documented in DESIGN.md.
    pub(crate) fn ignore(self: &Arc<Self>) {
        let ignored = self.ignored_consumers.fetch_add(1, Ordering::AcqRel) + 1;
        let registered = self.registered_consumers.load(Ordering::Acquire);
        if registered == 1 && ignored == 1 {
            self.reply_cancel.trigger();
        }
        // ignored > registered (double-ignore) is a no-op beyond the counter,
        // satisfying "a doubly-ignored reply behaves as singly-ignored" (spec §8).
    }

    pub(crate) fn mark_read(&self) {
        self.read.store(true, Ordering::Release);
    }

    /// The failure chain, if this cell completed as a failure and no consumer
    /// has ever read it via `Reply::get` — a candidate unhandled exception
    /// (spec §4.1, §9).
    pub(crate) fn unread_failure(&self) -> Option<FailureChain> {
        if self.read.load(Ordering::Acquire) {
            return None;
        }
        match &*self.state.lock().unwrap() {
            CellState::Done(Outcome::Failed(chain)) => Some(chain.clone()),
            _ => None,
        }
    }

    pub(crate) fn snapshot(&self) -> ReplyPoll {
        match &*self.state.lock().unwrap() {
            CellState::Pending => ReplyPoll::Pending,
            CellState::Done(Outcome::Success(_)) => ReplyPoll::Succeeded,
            CellState::Done(Outcome::Failed(chain)) => ReplyPoll::Failed(chain.clone()),
            CellState::Done(Outcome::Cancelled) => ReplyPoll::Cancelled,
        }
    }
}

/// A cheap, `Clone`-able snapshot of a reply's completion state for polling
/// without awaiting (spec §6 "poll").
#[derive(Debug, Clone)]
pub enum ReplyPoll {
    Pending,
    Succeeded,
    Failed(FailureChain),
    Cancelled,
}

/// The future-like handle for one invocation of one node with one memory.
///
/// `V` must be `Send + Sync + Clone + 'static` because a memoized reply may be
/// read by many consumers concurrently without re-running the behavior.
pub struct Reply<V> {
    pub(crate) cell: Arc<ReplyCell>,
    _marker: std::marker::PhantomData<fn() -> V>,
}

impl<V> Clone for Reply<V> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<V> fmt::Debug for Reply<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply").field("key", &self.cell.key).finish()
    }
}

impl<V: Send + Sync + Clone + 'static> Reply<V> {
    pub(crate) fn from_cell(cell: Arc<ReplyCell>) -> Self {
        Self {
            cell,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn key(&self) -> ReplyKey {
        self.cell.key
    }

    /// Await the externally observable completion and return the value or the
    /// canonical failure chain. Cancellation surfaces as a failure whose
    /// encountered cause names cancellation explicitly.
    pub async fn get(&self) -> Result<V, FailureChain> {
        self.cell.await_outcome().await;
        self.cell.mark_read();
        match &self.cell.snapshot() {
            ReplyPoll::Succeeded => {
                let state = self.cell_done_outcome();
                match state {
                    Outcome::Success(v) => Ok(v
                        .downcast_ref::<V>()
                        .expect("reply value type mismatch: graph identity invariant violated")
                        .clone()),
                    _ => unreachable!(),
                }
            }
            ReplyPoll::Failed(chain) => Err(chain.clone().with_origin_if_unset(self.key())),
            ReplyPoll::Cancelled => Err(FailureChain::from_encountered(
                crate::error::EncounteredError::new("cancelled"),
            )
            .with_origin_if_unset(self.key())),
            ReplyPoll::Pending => unreachable!("await_outcome guarantees completion"),
        }
    }

    fn cell_done_outcome(&self) -> Outcome {
        // Re-read under lock to get the owned Arc<dyn Any> without cloning the
        // whole chain twice; snapshot() above already proved completion.
        match &*self.cell_state_guard() {
            CellState::Done(Outcome::Success(v)) => Outcome::Success(v.clone()),
            CellState::Done(Outcome::Failed(c)) => Outcome::Failed(c.clone()),
            CellState::Done(Outcome::Cancelled) => Outcome::Cancelled,
            CellState::Pending => unreachable!(),
        }
    }

    fn cell_state_guard(&self) -> std::sync::MutexGuard<'_, CellState> {
        self.cell.state.lock().unwrap()
    }

    /// Poll without awaiting.
    pub fn poll(&self) -> ReplyPoll {
        self.cell.snapshot()
    }

    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// The container-exception view (spec §6 exception accessors).
    pub fn container_exception(&self) -> Option<FailureChain> {
        match self.poll() {
            ReplyPoll::Failed(chain) => Some(chain),
            _ => None,
        }
    }

    /// The call-stack-decoration view.
    pub fn call_stack_exception(&self) -> Option<Vec<crate::error::CallFrame>> {
        match self.poll() {
            ReplyPoll::Failed(chain) => Some(chain.call_stack().to_vec()),
            _ => None,
        }
    }

    /// The encountered-exception view (one layer in from the container).
    pub fn encountered_exception(&self) -> Option<crate::error::EncounteredError> {
        match self.poll() {
            ReplyPoll::Failed(chain) => Some(chain.encountered.clone()),
            _ => None,
        }
    }

    /// The first-non-container view — the canonical way to inspect the
    /// original cause (spec §7).
    pub fn first_non_container_exception(&self) -> Option<crate::error::EncounteredError> {
        self.encountered_exception()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn key(n: u64, m: u64) -> ReplyKey {
        ReplyKey {
            node: NodeId(n),
            memory: MemoryId(m),
        }
    }

    #[tokio::test]
    async fn completes_once_and_is_readable_by_many() {
        let cell = ReplyCell::new(key(1, 1), StdArc::from("n"), CancelSignal::new());
        cell.complete(Outcome::Success(StdArc::new(42i32)));
        let r1: Reply<i32> = Reply::from_cell(cell.clone());
        let r2: Reply<i32> = Reply::from_cell(cell);
        assert_eq!(r1.get().await.unwrap(), 42);
        assert_eq!(r2.get().await.unwrap(), 42);
    }

    #[test]
    fn ignore_triggers_only_for_sole_consumer() {
        let cell = ReplyCell::new(key(1, 1), StdArc::from("n"), CancelSignal::new());
        cell.register_consumer();
        cell.register_consumer();
        cell.ignore();
        assert!(!cell.reply_cancel.is_triggered(), "two consumers: not provably unique");

        let cell2 = ReplyCell::new(key(1, 2), StdArc::from("n"), CancelSignal::new());
        cell2.register_consumer();
        cell2.ignore();
        assert!(cell2.reply_cancel.is_triggered());
        // double ignore is a no-op beyond the first trigger
        cell2.ignore();
        assert!(cell2.reply_cancel.is_triggered());
    }
}
