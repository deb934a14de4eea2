//! A concurrency and memoization engine for static asynchronous
//! data-dependency graphs.
//!
//! A graph is a fixed set of [`Node`]s, each an immutable description of one
//! asynchronous computation and the dependencies it statically declares.
//! Running the graph against a root input opens a [`GraphCall`]: every node
//! runs at most once per `(node, memory-instance)` pair, dependency
//! completions are memoized replies consumers read through, and cancellation
//! propagates through three independent tiers — the call, the memory scope,
//! and the individual reply — so that abandoning a call or simply no longer
//! caring about one reply can stop exactly the work that's no longer needed
//! without tearing down everything else in flight.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use graphcall_core::behavior::Behavior;
//! use graphcall_core::call::GraphCall;
//! use graphcall_core::graph::Graph;
//! use graphcall_core::memory::MemoryKindId;
//! use graphcall_core::node::{NodeBuilder, NodeDyn};
//!
//! const ROOT: MemoryKindId = MemoryKindId("root");
//!
//! # async fn run() {
//! let greeting = NodeBuilder::new(
//!     "greeting",
//!     ROOT,
//!     Behavior::plain(|_device| Box::pin(async { Ok("hello, world".to_string()) })),
//! )
//! .build();
//!
//! let graph = Graph::from_roots(vec![greeting.clone() as Arc<dyn NodeDyn>]).unwrap();
//! let call = GraphCall::open_default(&graph, Arc::new(()));
//! let reply = call.invoke(&greeting).await;
//! assert_eq!(reply.get().await.unwrap(), "hello, world");
//! call.weakly_close().await;
//! # }
//! ```

pub mod behavior;
pub mod call;
pub mod device;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod memory;
pub mod node;
pub mod observer;
pub mod reply;
pub mod scope;
pub mod spawner;
pub mod store;

mod executor;

pub use behavior::{Behavior, BehaviorFuture, BehaviorResult, CancelSignalView, MayInterrupt};
pub use call::{AbandonedState, CloseOutcome, FinalState, GraphCall};
pub use error::{EncounteredError, FailureChain, GraphError, Result};
pub use graph::{Graph, GraphCandidate, GraphConfig, GraphValidator};
pub use interrupt::{InterruptModifier, NoopInterruptModifier};
pub use memory::{Memory, MemoryFactory, MemoryKindId};
pub use node::{
    CancelMode, DependencyLifetime, ExceptionStrategy, MemoryTarget, Node, NodeBuilder, NodeDyn,
    Priming, PrimingFailurePolicy,
};
pub use observer::{NullObserver, Observer};
pub use reply::{MemoryId, NodeId, Reply, ReplyKey, ReplyPoll};
pub use spawner::{Spawner, TokioSpawner};
