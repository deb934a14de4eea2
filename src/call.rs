//! [`GraphCall`] — one execution of a [`crate::graph::Graph`] against one root
//! input, and the three-tier cancellation it anchors (spec §3, §4.5, §4.6).
//!
//! `CallInner` is the shared, internal state every node invocation threads
//! through (cancel signal, root scope, observer, spawner, and the ledger of
//! every reply ever registered during the call). `GraphCall` is the public
//! handle a caller drives through `open` → `invoke`* → `weakly_close` /
//! `abandon`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::FailureChain;
use crate::graph::Graph;
use crate::memory::Memory;
use crate::node::Node;
use crate::observer::{NullObserver, ObserverHandle};
use crate::reply::{MemoryId, Reply, ReplyCell, ReplyKey, ReplyPoll};
use crate::scope::{CancelSignal, MemoryScope};
use crate::spawner::{Spawner, TokioSpawner};

/// Tracks every reply ever registered during a call, so `weakly_close` can
/// await full drain and both `weakly_close` and `abandon` can recover the
/// unhandled-exception list (spec §4.5, §4.6, §9).
struct CallLedger {
    outstanding: AtomicUsize,
    all: Mutex<Vec<Arc<ReplyCell>>>,
    drained: Notify,
}

impl CallLedger {
    fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            all: Mutex::new(Vec::new()),
            drained: Notify::new(),
        }
    }

    fn register(&self, cell: Arc<ReplyCell>) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.all.lock().unwrap().push(cell);
    }

    fn complete(&self, _key: crate::reply::ReplyKey) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "call ledger underflow");
        if prev == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn await_drain(&self) {
        loop {
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn unhandled_exceptions(&self) -> Vec<FailureChain> {
        self.all
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cell| cell.unread_failure())
            .collect()
    }
}

/// Shared internal state for one call, threaded by `Arc` through every
/// invocation the call spawns (spec §3 "GraphCall"). Public only so that
/// [`crate::node::NodeDyn::invoke_dyn`] can name it in its signature; there is
/// no public constructor, so callers can never obtain one directly.
pub struct CallInner {
    pub(crate) cancel: Arc<CancelSignal>,
    pub(crate) observer: ObserverHandle,
    pub(crate) spawner: Arc<dyn Spawner>,
    ledger: CallLedger,
    next_memory_id: AtomicU64,
    /// Diagnostic registry of every memory created during the call (root plus
    /// every `new-memory` dependency's memory), for graph introspection.
    memories: Mutex<Vec<Arc<Memory>>>,
    /// Every root node invoked directly against this call, in invocation
    /// order — the source for `FinalState`/`AbandonedState`'s per-root
    /// outcomes (spec §4.5, §6).
    roots: Mutex<Vec<(Arc<str>, Arc<ReplyCell>)>>,
    /// Every reply ignored during the call, whether through a behavior's
    /// device or directly by the caller (spec §4.5 "ignored replies").
    ignored: Mutex<Vec<ReplyKey>>,
    /// Observer hook panics, captured rather than left to abort the pipeline
    /// (spec §4.1, §7 "observer failure").
    observer_failures: Mutex<Vec<FailureChain>>,
}

impl CallInner {
    pub(crate) fn next_memory_id(&self) -> MemoryId {
        MemoryId(self.next_memory_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register_memory(&self, memory: &Arc<Memory>) {
        self.memories.lock().unwrap().push(memory.clone());
    }

    pub(crate) fn register_reply(&self, cell: Arc<ReplyCell>) {
        self.ledger.register(cell);
    }

    pub(crate) fn complete_reply(&self, key: crate::reply::ReplyKey) {
        self.ledger.complete(key);
    }

    pub(crate) fn register_root(&self, role: Arc<str>, cell: Arc<ReplyCell>) {
        self.roots.lock().unwrap().push((role, cell));
    }

    pub(crate) fn record_ignore(&self, key: ReplyKey) {
        self.ignored.lock().unwrap().push(key);
    }

    pub(crate) fn record_observer_failure(&self, failure: FailureChain) {
        self.observer_failures.lock().unwrap().push(failure);
    }

    fn root_cells(&self) -> Vec<Arc<ReplyCell>> {
        self.roots.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    fn root_outcomes(&self) -> Vec<(Arc<str>, ReplyPoll)> {
        self.roots
            .lock()
            .unwrap()
            .iter()
            .map(|(role, cell)| (role.clone(), cell.snapshot()))
            .collect()
    }

    fn ignored_replies(&self) -> Vec<ReplyKey> {
        self.ignored.lock().unwrap().clone()
    }

    /// Every unhandled exception: failures nobody ever retrieved via
    /// `Reply::get`, plus any observer hook that panicked (spec §4.1, §4.5,
    /// §9 "collected" into the same list).
    fn unhandled_exceptions(&self) -> Vec<FailureChain> {
        let mut exceptions = self.ledger.unhandled_exceptions();
        exceptions.extend(self.observer_failures.lock().unwrap().iter().cloned());
        exceptions
    }
}

/// The snapshot a successful, fully-drained close produces (spec §4.5
/// "weakly-close", §6 "Exit states").
#[derive(Debug, Clone)]
pub struct FinalState {
    /// Failures nobody ever retrieved via `Reply::get` before the call closed,
    /// including any observer hook that panicked.
    pub unhandled_exceptions: Vec<FailureChain>,
    /// Each root node invoked against this call, paired with its outcome, in
    /// invocation order.
    pub root_outcomes: Vec<(Arc<str>, ReplyPoll)>,
    /// Every reply ignored during the call (via a device or directly).
    pub ignored_replies: Vec<ReplyKey>,
    /// Always `false` for a naturally-closed call (spec §6).
    pub is_abandoned: bool,
}

/// The snapshot an abandoned call produces (spec §4.6 "abandon", §6 "Exit
/// states"). Same shape as [`FinalState`] but with `is_abandoned = true` and
/// no completeness guarantee — whatever was known at the instant `abandon`
/// ran.
#[derive(Debug, Clone)]
pub struct AbandonedState {
    /// Failures nobody ever retrieved, including any observer failures raised
    /// while tearing the call down — both land in the same list (spec §9,
    /// Open Question: observer failures during abandon get no special
    /// precedence over the abandon state itself).
    pub unhandled_exceptions: Vec<FailureChain>,
    pub root_outcomes: Vec<(Arc<str>, ReplyPoll)>,
    pub ignored_replies: Vec<ReplyKey>,
    /// Always `true`.
    pub is_abandoned: bool,
}

/// The result of [`GraphCall::weakly_close_or_abandon_on`]: which of the two
/// lifecycle exits actually ran (spec §4.5 "flags whichever path ran").
#[derive(Debug, Clone)]
pub enum CloseOutcome {
    /// `weakly_close` finished draining before `deadline`.
    Closed(FinalState),
    /// `deadline` elapsed first, so the call was abandoned instead.
    Abandoned(AbandonedState),
}

/// One execution of a graph against a root input (spec §3, §4.5, §4.6).
///
/// `open` is the only constructor; `invoke` is the only way to run a node
/// against the call's root memory. `weakly_close` and `abandon` are each
/// single-shot — calling either a second time, or calling `invoke` after
/// either has run, is a lifecycle violation the call only weakly enforces
/// (logged, not panicked; spec §9 "weakly" contracts).
pub struct GraphCall {
    inner: Arc<CallInner>,
    root_memory: Arc<Memory>,
    closed: std::sync::atomic::AtomicBool,
}

impl GraphCall {
    /// Open a call against `graph`'s validated root set, with the given
    /// `root_input`.
    ///
    /// Taking `&Graph` rather than a bare [`crate::memory::MemoryKindId`] is
    /// deliberate: a `Graph` only exists once its validators have run (see
    /// [`crate::graph::Graph::build`]), so calling `open` at all is proof the
    /// root memory kind it derives its root memory from came from a
    /// structurally validated root set, not an arbitrary caller-chosen kind
    /// that never went through validation (spec §4.6, §8 properties 7/8).
    pub fn open(
        graph: &Graph,
        root_input: Arc<dyn std::any::Any + Send + Sync>,
        observer: ObserverHandle,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        let cancel = CancelSignal::new();
        let root_scope = MemoryScope::under_call(&cancel);
        let inner = Arc::new(CallInner {
            cancel,
            observer,
            spawner,
            ledger: CallLedger::new(),
            next_memory_id: AtomicU64::new(1),
            memories: Mutex::new(Vec::new()),
            roots: Mutex::new(Vec::new()),
            ignored: Mutex::new(Vec::new()),
            observer_failures: Mutex::new(Vec::new()),
        });
        let root_memory = Memory::new(
            MemoryId(0),
            graph.root_memory_kind(),
            root_input,
            root_scope,
            HashMap::new(),
        );
        inner.memories.lock().unwrap().push(root_memory.clone());
        Self {
            inner,
            root_memory,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Open a call with the default observer ([`NullObserver`]) and spawner
    /// ([`TokioSpawner`]).
    pub fn open_default(graph: &Graph, root_input: Arc<dyn std::any::Any + Send + Sync>) -> Self {
        Self::open(graph, root_input, Arc::new(NullObserver), Arc::new(TokioSpawner))
    }

    /// Invoke `node` against the call's root memory (spec §3 "invoke").
    pub async fn invoke<V: Send + Sync + Clone + 'static>(&self, node: &Arc<Node<V>>) -> Reply<V> {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(
                node = %node.core.role,
                "GraphCall invoked after weakly_close/abandon"
            );
        }
        let reply = crate::executor::invoke(&self.inner, &self.root_memory, node).await;
        // The call itself is a registered consumer of every root reply, so
        // `GraphCall::ignore` can participate in the "provably unique
        // consumer" proof the same way a device-held reply does (spec §4.3,
        // §4.4, §8.5).
        reply.cell.register_consumer();
        self.inner.register_root(node.core.role.clone(), reply.cell.clone());
        reply
    }

    /// Declare this call no longer cares about `reply` (spec §6 "Reply
    /// access ... ignore", §4.3 "external consumer").
    pub fn ignore<V: Send + Sync + Clone + 'static>(&self, reply: &Reply<V>) {
        self.inner.record_ignore(reply.key());
        reply.cell.ignore();
    }

    /// The root memory this call invokes nodes against.
    pub fn root_memory(&self) -> &Arc<Memory> {
        &self.root_memory
    }

    /// Directly trigger the call's own cancellation tier, cascading into
    /// every scope and (where applicable) reply signal beneath it (spec
    /// §4.3 tier 1).
    pub fn trigger_cancel_signal(&self) {
        self.inner.cancel.trigger();
    }

    /// Best-effort, single-shot close: await every root reply, trigger the
    /// call's own cancel signal, await every registered reply draining, then
    /// report any failures nobody ever retrieved (spec §4.5: "as soon as
    /// every root reply completes, the engine triggers the call cancel
    /// signal").
    pub async fn weakly_close(&self) -> FinalState {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("GraphCall.weakly_close called more than once");
        }
        for root in self.inner.root_cells() {
            root.await_outcome().await;
        }
        self.inner.cancel.trigger();
        self.inner.ledger.await_drain().await;
        FinalState {
            unhandled_exceptions: self.inner.unhandled_exceptions(),
            root_outcomes: self.inner.root_outcomes(),
            ignored_replies: self.inner.ignored_replies(),
            is_abandoned: false,
        }
    }

    /// Compose `weakly_close` and `abandon`: wait for natural drain until
    /// `deadline`, falling back to `abandon` if it isn't reached in time
    /// (spec §4.5 "Utility"). Typically used instead of a bare `weakly_close`
    /// when a caller needs a hard upper bound on how long it waits for a call
    /// to wind down.
    pub async fn weakly_close_or_abandon_on(&self, deadline: tokio::time::Instant) -> CloseOutcome {
        match tokio::time::timeout_at(deadline, self.weakly_close()).await {
            Ok(final_state) => CloseOutcome::Closed(final_state),
            Err(_) => CloseOutcome::Abandoned(self.abandon()),
        }
    }

    /// Abandon the call immediately: trigger cancellation without waiting for
    /// drain, and report whatever is known at this instant (spec §4.6).
    /// Never awaits outstanding work; calling this after `weakly_close` has
    /// already completed naturally is a no-op beyond the idempotent signal
    /// trigger (spec §8 "abandon called after natural completion").
    pub fn abandon(&self) -> AbandonedState {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("GraphCall.abandon called after weakly_close/abandon");
        }
        self.inner.cancel.trigger();
        AbandonedState {
            unhandled_exceptions: self.inner.unhandled_exceptions(),
            root_outcomes: self.inner.root_outcomes(),
            ignored_replies: self.inner.ignored_replies(),
            is_abandoned: true,
        }
    }
}
