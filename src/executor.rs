//! The node-call state machine: priming → behavior → waiting (spec §4.1).
//!
//! `invoke` is the single entry point every dependency call and every root
//! invocation funnels through. On a cache hit it returns immediately with the
//! existing (possibly still in-flight) reply; on a miss it spawns the
//! pipeline via the call's [`crate::spawner::Spawner`] and returns the fresh
//! reply right away, so that a consumer racing two dependencies (spec §8
//! scenario 6) never blocks check-in on either of them completing.

use std::sync::Arc;

use crate::behavior::{Behavior, CancelSignalView};
use crate::call::CallInner;
use crate::device::{DependencyCallingDevice, InvocationRecord};
use crate::error::FailureChain;
use crate::memory::Memory;
use crate::node::{DependencyEdge, Node, NodeDyn, Priming};
use crate::observer::{self, HookOutcome};
use crate::reply::{Outcome, Reply, ReplyCell};
use crate::scope::CancelSignal;

/// Invoke `node` against `memory`, memoizing against the memory's own store.
/// Never awaits the pipeline itself — safe to call repeatedly and race.
pub(crate) async fn invoke<V: Send + Sync + Clone + 'static>(
    call: &Arc<CallInner>,
    memory: &Arc<Memory>,
    node: &Arc<Node<V>>,
) -> Reply<V> {
    // "observer.every_call_before happens-before storage lookup" (spec §5).
    let every_call_after = call.observer.every_call(&node.core.role);

    let goc = memory.storage.get_or_create(
        node.core.id,
        memory.id,
        node.core.role.clone(),
        CancelSignal::new(),
    );
    let cell = goc.cell().clone();
    let reply = Reply::<V>::from_cell(cell.clone());

    if !goc.is_new() {
        if let Some(failure) = observer::run_after(
            every_call_after,
            HookOutcome::Cached(cell.snapshot()),
            &node.core.role,
        ) {
            call.record_observer_failure(failure);
        }
        return reply;
    }

    // This invocation owns the pipeline (spec §3 "Storage").
    call.register_reply(cell.clone());
    memory.scope.register_reply();
    let first_call_after = call.observer.first_call(&node.core.role);

    let call = call.clone();
    let memory = memory.clone();
    let node = node.clone();
    let cell_for_task = cell.clone();
    call.clone().spawner.spawn(Box::pin(async move {
        run_pipeline(&call, &memory, &node, &cell_for_task).await;
        let outcome = cell_for_task.snapshot();
        if let Some(failure) = observer::run_after(
            every_call_after,
            HookOutcome::Completed(outcome.clone()),
            &node.core.role,
        ) {
            call.record_observer_failure(failure);
        }
        if let Some(failure) = observer::run_after(
            first_call_after,
            HookOutcome::Completed(outcome),
            &node.core.role,
        ) {
            call.record_observer_failure(failure);
        }
        call.complete_reply(cell_for_task.key);
        memory.scope.complete_reply();
    }));

    reply
}

/// Resolve and invoke one dependency edge (same-memory or new-memory),
/// type-erased. Shared by the priming loop and [`DependencyCallingDevice::call`].
pub(crate) async fn invoke_edge(
    call: &Arc<CallInner>,
    memory: &Arc<Memory>,
    edge: &DependencyEdge,
    owner_record: &Arc<InvocationRecord>,
) -> Arc<ReplyCell> {
    let cell = match edge.memory_target {
        crate::node::MemoryTarget::SameMemory => {
            edge.target.clone().invoke_dyn(call.clone(), memory.clone()).await
        }
        crate::node::MemoryTarget::NewMemory => {
            let factory = edge
                .memory_factory
                .as_ref()
                .expect("new-memory edge missing its MemoryFactory");
            let child_scope = memory.scope.child();
            let memory_id = call.next_memory_id();
            let child_memory = factory.create(memory, child_scope.clone(), memory_id);
            call.register_memory(&child_memory);
            owner_record.register_child_scope(child_scope);
            edge.target.clone().invoke_dyn(call.clone(), child_memory).await
        }
    };
    cell.register_consumer();
    owner_record.register(cell.clone());
    cell
}

/// Runs the full priming → behavior → waiting pipeline for one fresh
/// invocation and publishes its completion onto `cell`.
async fn run_pipeline<V: Send + Sync + Clone + 'static>(
    call: &Arc<CallInner>,
    memory: &Arc<Memory>,
    node: &Arc<Node<V>>,
    cell: &Arc<ReplyCell>,
) {
    let record: Arc<InvocationRecord> = Arc::new(InvocationRecord::default());

    // --- Priming phase -----------------------------------------------------
    if memory.scope.is_cancelled() || call.cancel.is_triggered() {
        finish(memory, node, cell, &record, Outcome::Cancelled).await;
        return;
    }

    let mut primed_failures: Vec<(crate::reply::ReplyKey, FailureChain)> = Vec::new();
    let mut fail_fast_outcome: Option<FailureChain> = None;

    // Interrupt isolation wraps every dependency call this node's own
    // pipeline makes, not just a custom action's cancel action (spec §4.3,
    // §5: "the thread's interrupt is saved-and-cleared before any dependency
    // call or custom-action run").
    let interrupt_capable = matches!(
        node.core.cancel_mode,
        crate::node::CancelMode::CustomAction { may_interrupt: true }
    );

    // Invoke every primed dependency in declared order first (spec §4.1 step
    // 3), so they run concurrently; only then apply the priming-failure
    // policy's wait semantics (step 4) — waiting on dep[0] must not delay
    // starting dep[1].
    let mut dep_cells = Vec::new();
    for edge in node
        .core
        .dependencies
        .iter()
        .filter(|e| e.priming == Priming::Primed)
    {
        if interrupt_capable {
            node.core.interrupt_modifier.pre_critical_section();
        }
        let dep_cell = invoke_edge(call, memory, edge, &record).await;
        if interrupt_capable {
            node.core.interrupt_modifier.post_critical_section();
        }
        dep_cells.push(dep_cell);
    }

    match node.core.priming_failure_policy {
        crate::node::PrimingFailurePolicy::WaitAll => {
            futures::future::join_all(dep_cells.iter().map(|c| c.await_outcome())).await;
            for dep_cell in &dep_cells {
                if let crate::reply::ReplyPoll::Failed(chain) = dep_cell.snapshot() {
                    primed_failures.push((dep_cell.key, chain));
                }
            }
        }
        crate::node::PrimingFailurePolicy::FailFast => {
            for dep_cell in &dep_cells {
                dep_cell.await_outcome().await;
                if let crate::reply::ReplyPoll::Failed(chain) = dep_cell.snapshot() {
                    fail_fast_outcome = Some(chain);
                    break;
                }
            }
        }
    }

    if let Some(chain) = fail_fast_outcome {
        // The failing primed dependency's reply becomes this node's outcome
        // verbatim — the behavior never ran, so there is nothing to decorate
        // (spec §4.1, §8 scenario 4).
        finish(memory, node, cell, &record, Outcome::Failed(chain)).await;
        return;
    }

    // Re-poll before the behavior phase (spec §4.1 step 5).
    let reply_cancel_applies = matches!(
        node.core.cancel_mode,
        crate::node::CancelMode::CompositeSignal | crate::node::CancelMode::CustomAction { .. }
    );
    if memory.scope.is_cancelled()
        || call.cancel.is_triggered()
        || (reply_cancel_applies && cell.reply_cancel.is_triggered())
    {
        finish(memory, node, cell, &record, Outcome::Cancelled).await;
        return;
    }

    // --- Behavior phase ------------------------------------------------------
    let device = DependencyCallingDevice::new(
        call.clone(),
        memory.clone(),
        record.clone(),
        node.clone() as Arc<dyn NodeDyn>,
    );

    let before_behavior_after = call.observer.before_behavior(&node.core.role);
    let behavior_result = run_behavior(call, node, cell, &device).await;
    device.close();
    let behavior_poll = match &behavior_result {
        Ok(_) => crate::reply::ReplyPoll::Succeeded,
        Err(chain) => crate::reply::ReplyPoll::Failed(chain.clone()),
    };
    if let Some(failure) = observer::run_after(
        before_behavior_after,
        HookOutcome::Completed(behavior_poll),
        &node.core.role,
    ) {
        call.record_observer_failure(failure);
    }

    let outcome = match behavior_result {
        Ok(value) => Outcome::Success(Arc::new(value)),
        Err(chain) => {
            let decorated = chain.clone().decorate(node.core.role.clone());
            let decorated = match node.core.exception_strategy {
                crate::node::ExceptionStrategy::Suppress => {
                    let mut d = decorated;
                    // Exclude the primed dependency the behavior itself
                    // re-raised (its reply key becomes `chain.origin` via
                    // `Reply::get`), so a re-raised failure is never
                    // suppressed as its own sibling.
                    for (key, sibling) in &primed_failures {
                        if Some(*key) != chain.origin {
                            d = d.with_suppressed(sibling.clone());
                        }
                    }
                    d
                }
                crate::node::ExceptionStrategy::Discard => decorated,
            };
            Outcome::Failed(decorated)
        }
    };

    finish(memory, node, cell, &record, outcome).await;
}

async fn run_behavior<V: Send + Sync + Clone + 'static>(
    call: &Arc<CallInner>,
    node: &Arc<Node<V>>,
    cell: &Arc<ReplyCell>,
    device: &Arc<DependencyCallingDevice>,
) -> Result<V, FailureChain> {
    let node_role = node.core.role.clone();
    match &node.behavior {
        Behavior::Plain(f) => f(device.clone()).await,
        Behavior::CompositeSignal(f) => {
            let view = CancelSignalView {
                call: call.cancel.clone(),
                scope: device.memory.scope.cancel.clone(),
                reply: cell.reply_cancel.clone(),
            };
            f(device.clone(), view).await
        }
        Behavior::CustomAction(f, may_interrupt) => {
            let (fut, action) = f(device.clone());
            let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let watch_call = call.cancel.clone();
            let watch_scope = device.memory.scope.cancel.clone();
            let watch_reply = cell.reply_cancel.clone();
            let fired_watch = fired.clone();
            let interrupt_modifier = node.core.interrupt_modifier.clone();
            let may_interrupt = may_interrupt.0;
            let watch_observer = call.observer.clone();
            let watch_node_role = node_role.clone();
            let watch_call_inner = call.clone();
            let watcher = tokio::spawn(async move {
                tokio::select! {
                    _ = watch_call.triggered_async() => {}
                    _ = watch_scope.triggered_async() => {}
                    _ = watch_reply.triggered_async() => {}
                }
                if !fired_watch.swap(true, std::sync::atomic::Ordering::AcqRel) {
                    let after = watch_observer.before_custom_action(&watch_node_role);
                    if may_interrupt {
                        interrupt_modifier.pre_critical_section();
                    }
                    action();
                    if may_interrupt {
                        interrupt_modifier.post_critical_section();
                    }
                    if let Some(failure) = crate::observer::run_after(
                        after,
                        HookOutcome::Completed(crate::reply::ReplyPoll::Succeeded),
                        &watch_node_role,
                    ) {
                        watch_call_inner.record_observer_failure(failure);
                    }
                }
            });
            let result = fut.await;
            watcher.abort();
            result
        }
    }
}

async fn finish<V: Send + Sync + Clone + 'static>(
    _memory: &Arc<Memory>,
    node: &Arc<Node<V>>,
    cell: &Arc<ReplyCell>,
    record: &Arc<InvocationRecord>,
    outcome: Outcome,
) {
    // Waiting phase: defer externally-observable completion until this
    // node's declared dependency-lifetime is satisfied (spec §4.1).
    let direct: Vec<Arc<ReplyCell>> = record.direct.lock().unwrap().clone();
    match node.core.dependency_lifetime {
        crate::node::DependencyLifetime::NodeForAll => {
            // Walk the transitive closure: each dependency records its own
            // direct dependencies before completing, so following
            // `next.dependencies()` after awaiting it reaches every
            // downstream dependency call made anywhere in the subtree.
            let mut frontier = direct.clone();
            let mut seen = std::collections::HashSet::new();
            while let Some(next) = frontier.pop() {
                if !seen.insert(next.key) {
                    continue;
                }
                next.await_outcome().await;
                frontier.extend(next.dependencies());
            }
        }
        crate::node::DependencyLifetime::NodeForDirect => {
            for dep in &direct {
                dep.await_outcome().await;
            }
        }
        crate::node::DependencyLifetime::Graph => {}
    }

    // Child scopes this invocation opened can no longer receive registrations.
    record.close_child_scopes();

    cell.set_dependencies(direct);
    if !cell.is_done() {
        cell.complete(outcome);
    }
}

/// [`NodeDyn`] impl: every concrete `Node<V>` is driven through the
/// type-erased entry point the same way, by delegating to [`invoke`] and
/// exposing only the resulting [`ReplyCell`]. Taking `self: Arc<Self>` (rather
/// than `&self`) is what lets this recover a concrete `Arc<Node<V>>` to clone
/// into the spawned pipeline task, even though callers only hold
/// `Arc<dyn NodeDyn>`.
impl<V: Send + Sync + Clone + 'static> NodeDyn for Node<V> {
    fn core(&self) -> &crate::node::NodeCore {
        &self.core
    }

    fn invoke_dyn(
        self: Arc<Self>,
        call: Arc<CallInner>,
        memory: Arc<Memory>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Arc<ReplyCell>> + Send>> {
        Box::pin(async move {
            let reply = invoke(&call, &memory, &self).await;
            reply.cell
        })
    }
}
