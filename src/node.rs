//! [`Node`] — the immutable static description of one memoized asynchronous
//! computation (spec §3, §6).
//!
//! A node's dependency edges reference other nodes whose output type may
//! differ from the node's own; since Rust generics can't express a
//! heterogeneous `Vec` of `Node<T>` for varying `T` directly, edges hold a
//! type-erased [`NodeDyn`] trait object and the owning `Node<V>` downcasts
//! back to its concrete type only at the call site inside the executor. This
//! is the same "push genericity to the edges, keep one concrete storage
//! shape in the middle" trick [`crate::reply::ReplyCell`] uses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::behavior::Behavior;
use crate::call::CallInner;
use crate::interrupt::{InterruptModifier, NoopInterruptModifier};
use crate::memory::{Memory, MemoryFactory, MemoryKindId};
use crate::reply::{NodeId, ReplyCell};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

fn next_node_id() -> NodeId {
    NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
}

/// How the engine reacts when a primed dependency fails during priming
/// (spec §3, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimingFailurePolicy {
    /// Await every primed dependency regardless of individual outcomes before
    /// proceeding to the behavior (default).
    WaitAll,
    /// End the priming phase at the first primed dependency that publishes a
    /// failed reply; that failure becomes this node's outcome.
    FailFast,
}

/// The completion envelope a node owes its consumers (spec §3, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyLifetime {
    /// Await every direct *and* transitive dependency-call made during this
    /// invocation.
    NodeForAll,
    /// Await every direct dependency-call made during this invocation.
    NodeForDirect,
    /// No additional wait; the obligation propagates to this node's own
    /// consumers.
    Graph,
}

/// How a re-raised, already-canonical failure is decorated (spec §3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionStrategy {
    /// Keep other primed-dependency failures attached as suppressed causes
    /// (default).
    Suppress,
    /// Drop other primed-dependency failures.
    Discard,
}

/// Which cancellation hooks a node opts into beyond the mandatory passive
/// checks (spec §3, §4.3).
#[derive(Clone, Copy, Default)]
pub enum CancelMode {
    #[default]
    Standard,
    CompositeSignal,
    CustomAction {
        may_interrupt: bool,
    },
}

/// Whether a dependency's target memory is the current memory or a freshly
/// constructed one (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTarget {
    SameMemory,
    NewMemory,
}

/// Whether the engine invokes the dependency automatically during priming, or
/// the behavior must invoke it itself through the device (spec §3, §6, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priming {
    Primed,
    Unprimed,
}

/// The type-erased half of a node: everything the engine needs to run the
/// pipeline without knowing the output type. Public only so that
/// [`crate::graph::Graph`] can accept a heterogeneous collection of root
/// nodes; the `invoke_dyn` half is `pub(crate)`-only useful from inside this
/// crate.
pub trait NodeDyn: Send + Sync {
    fn core(&self) -> &NodeCore;
    /// Run this node's full check-in + pipeline for `memory`, returning the
    /// (possibly cached) type-erased reply cell. Takes owned `Arc`s and an
    /// `Arc<Self>` receiver (rather than `&self`) so the concrete `Node<V>`
    /// impl can clone itself into the spawned pipeline task.
    fn invoke_dyn(
        self: Arc<Self>,
        call: Arc<CallInner>,
        memory: Arc<Memory>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Arc<ReplyCell>> + Send>>;
}

/// One dependency declared by a node: the target (type-erased), whether it
/// targets the same memory or a new one, and whether it's primed.
pub struct DependencyEdge {
    pub target: Arc<dyn NodeDyn>,
    pub memory_target: MemoryTarget,
    pub priming: Priming,
    pub memory_factory: Option<Arc<dyn MemoryFactory>>,
}

/// Everything about a node that doesn't depend on its output type.
pub struct NodeCore {
    pub id: NodeId,
    pub role: Arc<str>,
    pub memory_kind: MemoryKindId,
    pub dependencies: Vec<DependencyEdge>,
    pub priming_failure_policy: PrimingFailurePolicy,
    pub dependency_lifetime: DependencyLifetime,
    pub exception_strategy: ExceptionStrategy,
    pub cancel_mode: CancelMode,
    pub interrupt_modifier: Arc<dyn InterruptModifier>,
    /// Resource nodes this node declares itself the *envelope* for (spec
    /// §4.6, §6 "this resource node is consumed by an envelope node"). A
    /// per-node validator factory derived from this list is registered with
    /// every [`crate::graph::Graph`] this node ends up in; see
    /// [`crate::graph::consumer_envelops_dependency`].
    pub envelope_resources: Vec<NodeId>,
}

/// A node: static description + typed behavior.
pub struct Node<V> {
    pub(crate) core: NodeCore,
    pub(crate) behavior: Behavior<V>,
}

impl<V: Send + Sync + Clone + 'static> Node<V> {
    pub fn role(&self) -> &str {
        &self.core.role
    }

    pub fn id(&self) -> NodeId {
        self.core.id
    }
}

/// Builder for an immutable [`Node`] (spec §6 "Node construction").
pub struct NodeBuilder<V> {
    role: Arc<str>,
    memory_kind: MemoryKindId,
    behavior: Behavior<V>,
    dependencies: Vec<DependencyEdge>,
    priming_failure_policy: PrimingFailurePolicy,
    dependency_lifetime: DependencyLifetime,
    exception_strategy: ExceptionStrategy,
    cancel_mode: CancelMode,
    interrupt_modifier: Arc<dyn InterruptModifier>,
    envelope_resources: Vec<NodeId>,
}

impl<V: Send + Sync + Clone + 'static> NodeBuilder<V> {
    pub fn new(role: impl Into<Arc<str>>, memory_kind: MemoryKindId, behavior: Behavior<V>) -> Self {
        let cancel_mode = match &behavior {
            Behavior::Plain(_) => CancelMode::Standard,
            Behavior::CompositeSignal(_) => CancelMode::CompositeSignal,
            Behavior::CustomAction(_, may_interrupt) => CancelMode::CustomAction {
                may_interrupt: may_interrupt.0,
            },
        };
        Self {
            role: role.into(),
            memory_kind,
            behavior,
            dependencies: Vec::new(),
            priming_failure_policy: PrimingFailurePolicy::WaitAll,
            dependency_lifetime: DependencyLifetime::NodeForAll,
            exception_strategy: ExceptionStrategy::Suppress,
            cancel_mode,
            interrupt_modifier: Arc::new(NoopInterruptModifier),
            envelope_resources: Vec::new(),
        }
    }

    /// Declare this node the *envelope* for `resource`: a scoped resource
    /// node whose every other consumer must also be (transitively) consumed
    /// by this node, so the resource's lifetime never escapes the envelope's
    /// own call span (spec §4.6, §6, §8 scenario 8). Checked by
    /// [`crate::graph::consumer_envelops_dependency`] at graph-build time.
    pub fn envelops<D: Send + Sync + Clone + 'static>(mut self, resource: &Arc<Node<D>>) -> Self {
        self.envelope_resources.push(resource.core.id);
        self
    }

    pub fn priming_failure_policy(mut self, policy: PrimingFailurePolicy) -> Self {
        self.priming_failure_policy = policy;
        self
    }

    pub fn dependency_lifetime(mut self, lifetime: DependencyLifetime) -> Self {
        self.dependency_lifetime = lifetime;
        self
    }

    pub fn exception_strategy(mut self, strategy: ExceptionStrategy) -> Self {
        self.exception_strategy = strategy;
        self
    }

    pub fn interrupt_modifier(mut self, modifier: Arc<dyn InterruptModifier>) -> Self {
        self.interrupt_modifier = modifier;
        self
    }

    /// Declare a same-memory dependency edge: `target` runs against this
    /// node's own memory, so there is no child memory to construct and no
    /// factory to supply. A `new-memory` edge can only be declared through
    /// [`NodeBuilder::depends_on_with_memory`], which takes the factory as a
    /// required argument — there is deliberately no way to ask for a
    /// `new-memory` edge here and forget the factory (spec §6 "either
    /// same-memory or new-memory").
    pub fn depends_on<D: Send + Sync + Clone + 'static>(
        mut self,
        target: &Arc<Node<D>>,
        priming: Priming,
    ) -> Self {
        self.dependencies.push(DependencyEdge {
            target: target.clone() as Arc<dyn NodeDyn>,
            memory_target: MemoryTarget::SameMemory,
            priming,
            memory_factory: None,
        });
        self
    }

    pub fn depends_on_with_memory<D: Send + Sync + Clone + 'static>(
        mut self,
        target: &Arc<Node<D>>,
        priming: Priming,
        memory_factory: Arc<dyn MemoryFactory>,
    ) -> Self {
        self.dependencies.push(DependencyEdge {
            target: target.clone() as Arc<dyn NodeDyn>,
            memory_target: MemoryTarget::NewMemory,
            priming,
            memory_factory: Some(memory_factory),
        });
        self
    }

    pub fn build(self) -> Arc<Node<V>> {
        Arc::new(Node {
            core: NodeCore {
                id: next_node_id(),
                role: self.role,
                memory_kind: self.memory_kind,
                dependencies: self.dependencies,
                priming_failure_policy: self.priming_failure_policy,
                dependency_lifetime: self.dependency_lifetime,
                exception_strategy: self.exception_strategy,
                cancel_mode: self.cancel_mode,
                interrupt_modifier: self.interrupt_modifier,
                envelope_resources: self.envelope_resources,
            },
            behavior: self.behavior,
        })
    }
}
