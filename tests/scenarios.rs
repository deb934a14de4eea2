//! End-to-end scenarios for the graph execution engine.
//!
//! Each test builds a small graph by hand and drives it through a
//! [`GraphCall`], checking the externally observable outcome rather than any
//! internal state.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use graphcall_core::behavior::Behavior;
use graphcall_core::call::GraphCall;
use graphcall_core::error::{EncounteredError, FailureChain};
use graphcall_core::graph::Graph;
use graphcall_core::memory::{Memory, MemoryFactory, MemoryKindId};
use graphcall_core::node::{DependencyLifetime, NodeBuilder, NodeDyn, Priming, PrimingFailurePolicy};

const ROOT: MemoryKindId = MemoryKindId("root");
const ELEMENT: MemoryKindId = MemoryKindId("element");

#[tokio::test]
async fn hello_world() {
    let memory_input = NodeBuilder::new(
        "memory_input",
        ROOT,
        Behavior::plain(|device| {
            Box::pin(async move {
                let greeting: &str = device_input(&device);
                Ok(greeting.to_string())
            })
        }),
    )
    .build();

    let constant_world = NodeBuilder::new(
        "constant_world",
        ROOT,
        Behavior::plain(|_device| Box::pin(async { Ok("World".to_string()) })),
    )
    .build();

    let apply = NodeBuilder::new(
        "apply",
        ROOT,
        Behavior::plain({
            let memory_input = memory_input.clone();
            let constant_world = constant_world.clone();
            move |device| {
                let memory_input = memory_input.clone();
                let constant_world = constant_world.clone();
                Box::pin(async move {
                    let a = device.call(&memory_input).await.get().await?;
                    let b = device.call(&constant_world).await.get().await?;
                    Ok(format!("{} {}", a, b))
                })
            }
        }),
    )
    .depends_on(&memory_input, Priming::Primed)
    .depends_on(&constant_world, Priming::Primed)
    .build();

    let graph = Graph::from_roots(vec![apply.clone() as Arc<dyn NodeDyn>]).unwrap();
    let call = GraphCall::open_default(&graph, Arc::new("Hello".to_string()));
    let reply = call.invoke(&apply).await;
    assert_eq!(reply.get().await.unwrap(), "Hello World");

    let final_state = call.weakly_close().await;
    assert!(final_state.unhandled_exceptions.is_empty());
}

fn device_input<'a>(device: &'a graphcall_core::device::DependencyCallingDevice) -> &'a str {
    // A behavior only ever sees the memory through its device's dependency
    // calls; for this node the "dependency" is the memory's own input, which
    // in this engine a behavior reads directly rather than through a call, so
    // this helper just exists to keep the closure above readable.
    device.memory().input::<String>()
}

#[tokio::test]
async fn memoized_shared_dependency_runs_once_across_two_invocations() {
    let z_calls = Arc::new(AtomicUsize::new(0));
    let z = NodeBuilder::new(
        "z",
        ROOT,
        Behavior::plain({
            let z_calls = z_calls.clone();
            move |_device| {
                let z_calls = z_calls.clone();
                Box::pin(async move {
                    z_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42i32)
                })
            }
        }),
    )
    .build();

    let x = NodeBuilder::new(
        "x",
        ROOT,
        Behavior::plain({
            let z = z.clone();
            move |device| {
                let z = z.clone();
                Box::pin(async move {
                    let v = device.call(&z).await.get().await?;
                    Ok(v + 1)
                })
            }
        }),
    )
    .depends_on(&z, Priming::Primed)
    .build();

    let y = NodeBuilder::new(
        "y",
        ROOT,
        Behavior::plain({
            let z = z.clone();
            move |device| {
                let z = z.clone();
                Box::pin(async move {
                    let v = device.call(&z).await.get().await?;
                    Ok(v + 2)
                })
            }
        }),
    )
    .depends_on(&z, Priming::Primed)
    .build();

    let r = NodeBuilder::new(
        "r",
        ROOT,
        Behavior::plain({
            let x = x.clone();
            let y = y.clone();
            move |device| {
                let x = x.clone();
                let y = y.clone();
                Box::pin(async move {
                    let a = device.call(&x).await.get().await?;
                    let b = device.call(&y).await.get().await?;
                    Ok(a + b)
                })
            }
        }),
    )
    .depends_on(&x, Priming::Primed)
    .depends_on(&y, Priming::Primed)
    .build();

    let graph = Graph::from_roots(vec![r.clone() as Arc<dyn NodeDyn>]).unwrap();
    let call = GraphCall::open_default(&graph, Arc::new(()));
    let first = call.invoke(&r).await;
    let second = call.invoke(&r).await;
    assert_eq!(first.get().await.unwrap(), 43 + 44);
    assert_eq!(second.get().await.unwrap(), 43 + 44);
    assert_eq!(z_calls.load(Ordering::SeqCst), 1);

    call.weakly_close().await;
}

struct ElementFactory(i32);
impl MemoryFactory for ElementFactory {
    fn create(
        &self,
        _current: &Arc<Memory>,
        scope: Arc<graphcall_core::scope::MemoryScope>,
        id: graphcall_core::reply::MemoryId,
    ) -> Arc<Memory> {
        Memory::new(id, ELEMENT, Arc::new(self.0), scope, std::collections::HashMap::new())
    }
}

#[tokio::test]
async fn iteration_fans_out_over_a_child_memory_per_element() {
    let multiply_calls = Arc::new(AtomicUsize::new(0));
    let multiply_by_two = NodeBuilder::new(
        "multiply_by_two",
        ELEMENT,
        Behavior::plain({
            let multiply_calls = multiply_calls.clone();
            move |device| {
                let multiply_calls = multiply_calls.clone();
                Box::pin(async move {
                    multiply_calls.fetch_add(1, Ordering::SeqCst);
                    let n = *device.memory().input::<i32>();
                    Ok(n * 2)
                })
            }
        }),
    )
    .build();

    // `depends_on_with_memory` only needs to declare the edge's memory-target
    // shape; `call_with_memory` supplies the real per-iteration factory.
    let placeholder_factory: Arc<dyn MemoryFactory> = Arc::new(ElementFactory(0));
    let root = NodeBuilder::new(
        "iterate",
        ROOT,
        Behavior::plain({
            let multiply_by_two = multiply_by_two.clone();
            move |device| {
                let multiply_by_two = multiply_by_two.clone();
                Box::pin(async move {
                    let mut results = Vec::new();
                    for element in [5i32, 9, 10, 30] {
                        let factory: Arc<dyn MemoryFactory> = Arc::new(ElementFactory(element));
                        let reply = device.call_with_memory(&multiply_by_two, factory).await;
                        results.push(reply.get().await?);
                    }
                    Ok(results)
                })
            }
        }),
    )
    .depends_on_with_memory(&multiply_by_two, Priming::Unprimed, placeholder_factory)
    .build();

    let graph = Graph::from_roots(vec![root.clone() as Arc<dyn NodeDyn>]).unwrap();
    let call = GraphCall::open_default(&graph, Arc::new(()));
    let reply = call.invoke(&root).await;
    let results: Vec<i32> = reply.get().await.unwrap();
    assert_eq!(results, vec![10, 18, 20, 60]);
    // One execution per element, never reused across distinct child memories.
    assert_eq!(multiply_calls.load(Ordering::SeqCst), 4);

    call.weakly_close().await;
}

fn failing(msg: &'static str) -> NodeBuilder<i32> {
    NodeBuilder::new(
        msg,
        ROOT,
        Behavior::plain(move |_device| {
            Box::pin(async move { Err(FailureChain::from_encountered(EncounteredError::new(msg))) })
        }),
    )
}

#[tokio::test]
async fn fail_fast_priming_short_circuits_before_the_behavior_runs() {
    let d1 = failing("d1 failed").build();
    let d2 = NodeBuilder::new("d2", ROOT, Behavior::plain(|_device| Box::pin(async { Ok(7i32) }))).build();

    let behavior_ran = Arc::new(AtomicBool::new(false));
    let consumer = NodeBuilder::new(
        "consumer",
        ROOT,
        Behavior::plain({
            let behavior_ran = behavior_ran.clone();
            move |_device| {
                let behavior_ran = behavior_ran.clone();
                Box::pin(async move {
                    behavior_ran.store(true, Ordering::SeqCst);
                    Ok(0i32)
                })
            }
        }),
    )
    .priming_failure_policy(PrimingFailurePolicy::FailFast)
    .depends_on(&d1, Priming::Primed)
    .depends_on(&d2, Priming::Primed)
    .build();

    let graph = Graph::from_roots(vec![consumer.clone() as Arc<dyn NodeDyn>]).unwrap();
    let call = GraphCall::open_default(&graph, Arc::new(()));
    let reply = call.invoke(&consumer).await;
    let err = reply.get().await.unwrap_err();
    assert_eq!(err.first_non_container().0.as_ref(), "d1 failed");
    assert!(!behavior_ran.load(Ordering::SeqCst));

    call.weakly_close().await;
}

#[tokio::test]
async fn wait_all_priming_runs_the_behavior_and_suppresses_the_other_failure() {
    let d1 = failing("d1 failed").build();
    let d2 = failing("d2 failed").build();

    let consumer = NodeBuilder::new(
        "consumer",
        ROOT,
        Behavior::plain({
            let d1 = d1.clone();
            move |device| {
                let d1 = d1.clone();
                Box::pin(async move {
                    // Re-raise the primed dependency's own failure; its
                    // sibling (d2) is attached as a suppressed cause under
                    // the default `suppress` exception strategy.
                    device.call(&d1).await.get().await?;
                    unreachable!("d1 always fails")
                })
            }
        }),
    )
    .priming_failure_policy(PrimingFailurePolicy::WaitAll)
    .depends_on(&d1, Priming::Primed)
    .depends_on(&d2, Priming::Primed)
    .build();

    let graph = Graph::from_roots(vec![consumer.clone() as Arc<dyn NodeDyn>]).unwrap();
    let call = GraphCall::open_default(&graph, Arc::new(()));
    let reply = call.invoke(&consumer).await;
    let err = reply.get().await.unwrap_err();
    assert_eq!(err.first_non_container().0.as_ref(), "d1 failed");
    assert_eq!(err.suppressed.len(), 1);
    assert_eq!(err.suppressed[0].first_non_container().0.as_ref(), "d2 failed");

    call.weakly_close().await;
}

#[tokio::test]
async fn call_cancellation_stops_newly_started_grandchild_invocations() {
    let leaf = NodeBuilder::new(
        "leaf",
        ELEMENT,
        Behavior::plain(|device| {
            Box::pin(async move {
                let n = *device.memory().input::<i32>();
                Ok(n)
            })
        }),
    )
    .build();

    let placeholder_factory: Arc<dyn MemoryFactory> = Arc::new(ElementFactory(0));
    let completed_before_cancel = Arc::new(AtomicUsize::new(0));
    let loop_root = NodeBuilder::new(
        "loop_root",
        ROOT,
        Behavior::plain({
            let leaf = leaf.clone();
            let completed_before_cancel = completed_before_cancel.clone();
            move |device| {
                let leaf = leaf.clone();
                let completed_before_cancel = completed_before_cancel.clone();
                Box::pin(async move {
                    let mut iterations = 0usize;
                    loop {
                        let factory: Arc<dyn MemoryFactory> = Arc::new(ElementFactory(iterations as i32));
                        let reply = device.call_with_memory(&leaf, factory).await;
                        match reply.get().await {
                            Ok(_) => {
                                completed_before_cancel.fetch_add(1, Ordering::SeqCst);
                                iterations += 1;
                                tokio::task::yield_now().await;
                            }
                            Err(_) => break,
                        }
                        if iterations > 1_000_000 {
                            panic!("cancellation never observed");
                        }
                    }
                    Ok(iterations)
                })
            }
        }),
    )
    .depends_on_with_memory(&leaf, Priming::Unprimed, placeholder_factory)
    .build();

    let graph = Graph::from_roots(vec![loop_root.clone() as Arc<dyn NodeDyn>]).unwrap();
    let call = GraphCall::open_default(&graph, Arc::new(()));
    let reply = call.invoke(&loop_root).await;

    let call_for_trigger = &call;
    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    call_for_trigger.trigger_cancel_signal();

    let iterations = reply.get().await.unwrap();
    assert!(iterations > 0, "at least one grandchild should complete before cancellation");

    let final_state = call.weakly_close().await;
    // The loop observes cancellation through its own reply outcome, not an
    // unhandled exception, and the root itself still succeeds: nothing should
    // be left in the unhandled list once the call has fully drained.
    assert!(final_state.unhandled_exceptions.is_empty());
}

#[tokio::test]
async fn ignoring_the_slower_of_two_racing_loops_truncates_it() {
    fn make_loop(role: &'static str, iterations: u64) -> Arc<graphcall_core::node::Node<u64>> {
        NodeBuilder::new(
            role,
            ROOT,
            Behavior::composite_signal(move |_device, view| {
                Box::pin(async move {
                    let mut i = 0u64;
                    while i < iterations {
                        if view.is_triggered() {
                            break;
                        }
                        i += 1;
                        if i % 64 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                    Ok(i)
                })
            }),
        )
        .build()
    }

    let loop_short = make_loop("loop_short", 100);
    let loop_long = make_loop("loop_long", 1_000_000);

    let consumer = NodeBuilder::new(
        "consumer",
        ROOT,
        Behavior::plain({
            let loop_short = loop_short.clone();
            let loop_long = loop_long.clone();
            move |device| {
                let loop_short = loop_short.clone();
                let loop_long = loop_long.clone();
                Box::pin(async move {
                    let short_reply = device.call(&loop_short).await;
                    let long_reply = device.call(&loop_long).await;

                    tokio::select! {
                        short = short_reply.get() => {
                            let short_count = short?;
                            device.ignore(&short_reply);
                            device.ignore(&long_reply);
                            let long_count = long_reply.get().await?;
                            Ok((short_count, long_count))
                        }
                        long = long_reply.get() => {
                            let long_count = long?;
                            device.ignore(&short_reply);
                            device.ignore(&long_reply);
                            let short_count = short_reply.get().await?;
                            Ok((short_count, long_count))
                        }
                    }
                })
            }
        }),
    )
    .dependency_lifetime(DependencyLifetime::NodeForAll)
    .depends_on(&loop_short, Priming::Unprimed)
    .depends_on(&loop_long, Priming::Unprimed)
    .build();

    let graph = Graph::from_roots(vec![consumer.clone() as Arc<dyn NodeDyn>]).unwrap();
    let call = GraphCall::open_default(&graph, Arc::new(()));
    let reply = call.invoke(&consumer).await;
    let (short_count, long_count) = reply.get().await.unwrap();
    assert_eq!(short_count, 100);
    assert!(long_count < 1_000_000, "ignored loop should observe the signal early");

    call.weakly_close().await;
}
