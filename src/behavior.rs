//! [`Behavior`] — the three behavior variants a node's async computation can
//! be built from (spec §4.1, §6, §9 "avoid deep inheritance").
//!
//! Rather than modeling plain / composite-signal / custom-action behaviors as
//! an inheritance hierarchy, they're a tagged enum with fixed payloads, the
//! way the teacher crate models node executors as a closure type
//! (`Arc<dyn Fn(Value) -> BoxFuture<...>>`) rather than a trait object
//! hierarchy.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::device::DependencyCallingDevice;
use crate::error::FailureChain;
use crate::scope::CancelSignal;

/// The result a behavior returns: either a value or a failure chain.
/// Behaviors construct a fresh [`FailureChain::from_encountered`] for a novel
/// failure, or propagate one read from a dependency's [`crate::reply::Reply::get`]
/// via `?` — the latter is how "re-raising a canonical chain" (spec §4.1, §7)
/// reaches the executor, which recognizes already-tagged chains by their
/// [`FailureChain::origin`].
pub type BehaviorResult<V> = Result<V, FailureChain>;

/// A boxed, `Send`-able future, the common return shape for all behavior
/// variants.
pub type BehaviorFuture<V> = Pin<Box<dyn Future<Output = BehaviorResult<V>> + Send>>;

/// Read-only combined view of the call, scope, and reply cancellation signals,
/// passed to composite-signal behaviors (spec §4.3 hook 3).
#[derive(Clone)]
pub struct CancelSignalView {
    pub(crate) call: Arc<CancelSignal>,
    pub(crate) scope: Arc<CancelSignal>,
    pub(crate) reply: Arc<CancelSignal>,
}

impl CancelSignalView {
    pub fn is_triggered(&self) -> bool {
        self.call.is_triggered() || self.scope.is_triggered() || self.reply.is_triggered()
    }
}

/// An action the engine may invoke when a cancellation signal fires for a
/// custom-action node (spec §4.3 hook 4). Invoked at most once per reply
/// (spec §5).
pub type CancelAction = Box<dyn Fn() + Send + Sync>;

/// Whether a custom action's cancellation may interrupt the behavior's running
/// worker, and if so, under what [`crate::interrupt::InterruptModifier`].
#[derive(Clone, Copy, Default)]
pub struct MayInterrupt(pub bool);

type PlainFn<V> =
    Arc<dyn Fn(Arc<DependencyCallingDevice>) -> BehaviorFuture<V> + Send + Sync>;
type CompositeSignalFn<V> = Arc<
    dyn Fn(Arc<DependencyCallingDevice>, CancelSignalView) -> BehaviorFuture<V> + Send + Sync,
>;
type CustomActionFn<V> = Arc<
    dyn Fn(Arc<DependencyCallingDevice>) -> (BehaviorFuture<V>, CancelAction) + Send + Sync,
>;

/// The three shapes a node's computation can take (spec §4.1, §6).
pub enum Behavior<V> {
    /// No cancellation hooks beyond the mandatory pre-priming / between-phase
    /// checks.
    Plain(PlainFn<V>),
    /// Opts into hook 3: a read-only combined signal view.
    CompositeSignal(CompositeSignalFn<V>),
    /// Opts into hook 4: an active cancel action, optionally interrupt-capable.
    CustomAction(CustomActionFn<V>, MayInterrupt),
}

impl<V> Behavior<V> {
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(Arc<DependencyCallingDevice>) -> BehaviorFuture<V> + Send + Sync + 'static,
    {
        Behavior::Plain(Arc::new(f))
    }

    pub fn composite_signal<F>(f: F) -> Self
    where
        F: Fn(Arc<DependencyCallingDevice>, CancelSignalView) -> BehaviorFuture<V>
            + Send
            + Sync
            + 'static,
    {
        Behavior::CompositeSignal(Arc::new(f))
    }

    pub fn custom_action<F>(f: F, may_interrupt: bool) -> Self
    where
        F: Fn(Arc<DependencyCallingDevice>) -> (BehaviorFuture<V>, CancelAction)
            + Send
            + Sync
            + 'static,
    {
        Behavior::CustomAction(Arc::new(f), MayInterrupt(may_interrupt))
    }
}
