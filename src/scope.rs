//! Cancellation-bearing scope tree (spec §3 "MemoryScope", §4.3).
//!
//! Scopes form a tree rooted at the call. Triggering a scope triggers every
//! descendant. A scope also tracks how many replies are currently registered
//! against it so that it can auto-trigger once the invocation that opened it
//! has finished waiting on everything it created (see [`MemoryScope::close`]).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// A single cancellation flag with cascading children.
///
/// Triggering is idempotent and race-free (spec §5): the first caller to win
/// the compare-exchange performs the cascade, everyone else observes an
/// already-triggered signal.
pub struct CancelSignal {
    triggered: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Arc<CancelSignal>>>,
}

impl CancelSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            triggered: AtomicBool::new(false),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        let child = Self::new();
        if self.is_triggered() {
            // Parent already gone: the child is born pre-triggered so nothing
            // started under it ever runs its behavior (spec §4.1 priming check).
            child.trigger();
        } else {
            self.children.lock().unwrap().push(child.clone());
        }
        child
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Trigger this signal and cascade to every descendant. Safe to call more
    /// than once; only the first call has any effect (spec §5 "triggering a
    /// signal is idempotent").
    pub fn trigger(self: &Arc<Self>) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify.notify_waiters();
            let children = std::mem::take(&mut *self.children.lock().unwrap());
            for child in children {
                child.trigger();
            }
        }
    }

    /// Suspend until triggered. A suspension point per spec §5.
    pub async fn triggered_async(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Tracks replies registered against a scope so it can auto-trigger once
/// drained and closed, the way [`crate::call::GraphCall::weakly_close`] does
/// at the call tier (spec §4.3: "triggered when all externally accessible
/// replies of the scope complete").
struct ScopeLedger {
    outstanding: AtomicUsize,
    closing: AtomicBool,
}

impl ScopeLedger {
    fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        }
    }

    fn register(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true if this completion drained the ledger while it was closing
    /// (i.e. the scope should now trigger its cancel signal).
    fn complete(&self) -> bool {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "scope ledger underflow");
        prev == 1 && self.closing.load(Ordering::Acquire)
    }

    /// Mark closed for new registrations. Returns true if already drained.
    fn close(&self) -> bool {
        self.closing.store(true, Ordering::Release);
        self.outstanding.load(Ordering::Acquire) == 0
    }
}

/// A node in the cancellation-scope tree. The call owns the root scope;
/// every `new-memory` dependency opens a child scope (spec §3, §4.4).
pub struct MemoryScope {
    pub cancel: Arc<CancelSignal>,
    parent: Option<Arc<MemoryScope>>,
    ledger: ScopeLedger,
}

impl MemoryScope {
    /// Construct a free-standing root scope (used by tests and by anything
    /// not nested under a call's own cancel signal).
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            cancel: CancelSignal::new(),
            parent: None,
            ledger: ScopeLedger::new(),
        })
    }

    /// Construct the scope a `GraphCall` owns as its root, nested directly
    /// under the call's own cancel signal so that triggering the call
    /// cascades into it (spec §3 "scopes nest ... arranged in a tree rooted
    /// at the call").
    pub fn under_call(call_cancel: &Arc<CancelSignal>) -> Arc<Self> {
        Arc::new(Self {
            cancel: call_cancel.child(),
            parent: None,
            ledger: ScopeLedger::new(),
        })
    }

    /// Open a child scope, e.g. for a freshly constructed `new-memory`
    /// dependency (spec §3 "creating a new memory from within a running node
    /// creates a child scope").
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            cancel: self.cancel.child(),
            parent: Some(self.clone()),
            ledger: ScopeLedger::new(),
        })
    }

    pub fn parent(&self) -> Option<&Arc<MemoryScope>> {
        self.parent.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_triggered()
    }

    pub async fn cancelled(&self) {
        self.cancel.triggered_async().await
    }

    /// Register a reply as belonging to this scope's externally-accessible set.
    pub fn register_reply(&self) {
        self.ledger.register();
    }

    /// Record one of this scope's registered replies completing. Triggers the
    /// scope's cancel signal if the scope has been closed and this was the
    /// last outstanding reply.
    pub fn complete_reply(self: &Arc<Self>) {
        if self.ledger.complete() {
            self.cancel.trigger();
        }
    }

    /// Close the scope for new registrations — called once the invocation that
    /// opened this scope (for a `new-memory` dependency) has finished its
    /// waiting phase, since no further dependency calls can be registered
    /// against it afterwards. If already drained, triggers immediately.
    pub fn close(self: &Arc<Self>) {
        if self.ledger.close() {
            self.cancel.trigger();
        }
    }
}
