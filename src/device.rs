//! [`DependencyCallingDevice`] — the only legal path by which a behavior
//! reaches a dependency (spec §4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::behavior::CancelSignalView;
use crate::call::CallInner;
use crate::memory::{Memory, MemoryFactory};
use crate::node::{MemoryTarget, Node, NodeDyn};
use crate::reply::{Reply, ReplyCell};

/// Per-invocation record of which dependency replies were registered, used by
/// the executor's waiting phase to implement `node-for-all` / `node-for-direct`
/// / `graph` dependency-lifetime semantics (spec §4.1, §9).
#[derive(Default)]
pub(crate) struct InvocationRecord {
    pub(crate) direct: Mutex<Vec<Arc<ReplyCell>>>,
    /// Child scopes this invocation opened for `new-memory` dependencies.
    /// Closed for new registrations once this invocation's waiting phase
    /// finishes (spec §4.3: the scope tier auto-triggers once drained and
    /// closed).
    pub(crate) child_scopes: Mutex<Vec<Arc<crate::scope::MemoryScope>>>,
}

impl InvocationRecord {
    pub(crate) fn register(&self, cell: Arc<ReplyCell>) {
        self.direct.lock().unwrap().push(cell);
    }

    pub(crate) fn register_child_scope(&self, scope: Arc<crate::scope::MemoryScope>) {
        self.child_scopes.lock().unwrap().push(scope);
    }

    pub(crate) fn close_child_scopes(&self) {
        for scope in self.child_scopes.lock().unwrap().drain(..) {
            scope.close();
        }
    }
}

/// The per-invocation bridge a behavior uses to invoke dependencies and ignore
/// replies (spec §4.4). A device is valid only for the duration of its
/// behavior's call; after the behavior contract is violated (see
/// [`DependencyCallingDevice::close`]) it weakly refuses further calls.
pub struct DependencyCallingDevice {
    pub(crate) call: Arc<CallInner>,
    pub(crate) memory: Arc<Memory>,
    pub(crate) record: Arc<InvocationRecord>,
    /// The node whose behavior this device was handed to — its declared edge
    /// list is consulted to resolve same-memory vs. new-memory targets (spec
    /// §4.4 "resolve the dependency edge's target memory").
    pub(crate) consumer: Arc<dyn NodeDyn>,
    closed: AtomicBool,
}

impl DependencyCallingDevice {
    pub(crate) fn new(
        call: Arc<CallInner>,
        memory: Arc<Memory>,
        record: Arc<InvocationRecord>,
        consumer: Arc<dyn NodeDyn>,
    ) -> Arc<Self> {
        Arc::new(Self {
            call,
            memory,
            record,
            consumer,
            closed: AtomicBool::new(false),
        })
    }

    /// Invoke `target`, a dependency statically declared on the node this
    /// device belongs to. Resolves the edge's declared memory target
    /// (same-memory or new-memory) the way the engine itself does during
    /// priming, so primed and unprimed dependencies share one resolution
    /// path (spec §4.4).
    pub async fn call<V: Send + Sync + Clone + 'static>(&self, target: &Arc<Node<V>>) -> Reply<V> {
        self.refuse_if_closed("call");

        // Interrupt isolation wraps every dependency call an interrupt-capable
        // custom-action node's behavior makes through this device, not just the
        // cancel action itself (spec §4.3, §5).
        let interrupt_capable = matches!(
            self.consumer.core().cancel_mode,
            crate::node::CancelMode::CustomAction { may_interrupt: true }
        );
        if interrupt_capable {
            self.consumer.core().interrupt_modifier.pre_critical_section();
        }
        let reply = self.call_edge(target).await;
        if interrupt_capable {
            self.consumer.core().interrupt_modifier.post_critical_section();
        }
        reply
    }

    async fn call_edge<V: Send + Sync + Clone + 'static>(&self, target: &Arc<Node<V>>) -> Reply<V> {
        let edge = self
            .consumer
            .core()
            .dependencies
            .iter()
            .find(|e| e.target.core().id == target.core.id)
            .unwrap_or_else(|| {
                panic!(
                    "node '{}' called undeclared dependency '{}' through its device",
                    self.consumer.core().role,
                    target.core.role
                )
            });
        let reply = match edge.memory_target {
            MemoryTarget::SameMemory => {
                crate::executor::invoke(&self.call, &self.memory, target).await
            }
            MemoryTarget::NewMemory => {
                let factory = edge
                    .memory_factory
                    .as_ref()
                    .expect("new-memory edge missing its MemoryFactory");
                let child_scope = self.memory.scope.child();
                let memory_id = self.call.next_memory_id();
                let child_memory = factory.create(&self.memory, child_scope.clone(), memory_id);
                self.call.register_memory(&child_memory);
                self.record.register_child_scope(child_scope);
                crate::executor::invoke(&self.call, &child_memory, target).await
            }
        };
        reply.cell.register_consumer();
        self.record.register(reply.cell.clone());
        reply
    }

    /// Invoke a `new-memory` dependency with a factory supplied at call time
    /// rather than the one (if any) declared on the edge — the hook iteration
    /// needs (spec §8 scenario 3): a root fans out over a list, and each
    /// element's child memory carries a different input, which a single
    /// edge-level factory fixed at graph-build time can't express. `target`
    /// must still be a statically declared `new-memory` dependency edge; only
    /// which factory builds the child memory is overridden per call.
    pub async fn call_with_memory<V: Send + Sync + Clone + 'static>(
        &self,
        target: &Arc<Node<V>>,
        factory: Arc<dyn MemoryFactory>,
    ) -> Reply<V> {
        self.refuse_if_closed("call_with_memory");
        let edge = self
            .consumer
            .core()
            .dependencies
            .iter()
            .find(|e| e.target.core().id == target.core.id)
            .unwrap_or_else(|| {
                panic!(
                    "node '{}' called undeclared dependency '{}' through its device",
                    self.consumer.core().role,
                    target.core.role
                )
            });
        assert_eq!(
            edge.memory_target,
            MemoryTarget::NewMemory,
            "call_with_memory used on node '{}'s same-memory dependency '{}'; use `call` instead",
            self.consumer.core().role,
            target.core.role
        );

        let interrupt_capable = matches!(
            self.consumer.core().cancel_mode,
            crate::node::CancelMode::CustomAction { may_interrupt: true }
        );
        if interrupt_capable {
            self.consumer.core().interrupt_modifier.pre_critical_section();
        }

        let child_scope = self.memory.scope.child();
        let memory_id = self.call.next_memory_id();
        let child_memory = factory.create(&self.memory, child_scope.clone(), memory_id);
        self.call.register_memory(&child_memory);
        self.record.register_child_scope(child_scope);
        let reply = crate::executor::invoke(&self.call, &child_memory, target).await;
        reply.cell.register_consumer();
        self.record.register(reply.cell.clone());

        if interrupt_capable {
            self.consumer.core().interrupt_modifier.post_critical_section();
        }
        reply
    }

    /// The memory this invocation is running against (spec §4.4 "ancestor
    /// access" and the "input-of-memory" node shape scenario §8.1 describes).
    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    /// A read-only combined cancellation-signal view for a given dependency's
    /// reply, for composite-signal behaviors (spec §4.3 hook 3). Pass the
    /// node's own id to view *its own* reply-tier signal, which the engine
    /// only ever triggers once this invocation itself is ignored by a unique
    /// consumer.
    pub fn own_cancel_signal_view(&self, own_reply: &Arc<ReplyCell>) -> CancelSignalView {
        CancelSignalView {
            call: self.call.cancel.clone(),
            scope: self.memory.scope.cancel.clone(),
            reply: own_reply.reply_cancel.clone(),
        }
    }

    /// Declare a consumer no longer cares about `reply`; may trigger the
    /// reply-level cancellation signal if the consumer is provably unique
    /// (spec §4.3, §4.4, §8.5).
    pub fn ignore<V: Send + Sync + Clone + 'static>(&self, reply: &Reply<V>) {
        self.call.record_ignore(reply.key());
        reply.cell.ignore();
    }

    /// Mark this device as no longer usable (spec §4.1 "the device weakly
    /// refuses further use thereafter"). Called by the executor once the
    /// behavior contract's deadline passes (behavior return and response
    /// completion).
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn refuse_if_closed(&self, op: &str) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(
                op,
                node = %self.consumer.core().role,
                "dependency-calling device used after its behavior's contract ended"
            );
            // Best-effort only (spec §9 "weakly" contracts): we log and
            // proceed rather than panicking, since the engine isn't obligated
            // to catch every violation.
        }
    }
}
