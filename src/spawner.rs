//! [`Spawner`] — how the engine executes a node's pipeline concurrently with
//! the caller that triggered it (SPEC_FULL.md §5 [ADDED]).
//!
//! Every cache-miss check-in spawns the priming/behavior/waiting pipeline
//! rather than running it inline, so that two consumers racing the same or
//! different dependencies (spec §8 scenario 6) never block check-in on one
//! another. The default [`TokioSpawner`] just calls `tokio::spawn`; tests that
//! want deterministic ordering can supply their own.

use std::future::Future;
use std::pin::Pin;

/// Runs a future to completion without the caller awaiting it.
pub trait Spawner: Send + Sync {
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Spawns onto the ambient tokio runtime.
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        tokio::spawn(future);
    }
}
