//! [`Observer`] — the four hook families the executor calls at defined points
//! (spec §4.1, §6).
//!
//! Each hook returns an "after" closure that must be invoked with the
//! outcome. The teacher crate's own observer-shaped surfaces (`Observer`
//! composition patterns are rare in `langgraph-core` itself, but its
//! `StreamWriter`/event-channel pattern in `stream.rs` and `runtime.rs` shows
//! the same "cheap when nobody's listening" design this module follows): the
//! fast path is allocation-free when the observer is [`NullObserver`].

use std::sync::Arc;

use crate::error::FailureChain;
use crate::reply::ReplyPoll;

/// The outcome handed to an "after" closure.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    Cached(ReplyPoll),
    Completed(ReplyPoll),
}

/// An "after" closure an observer hook returns, invoked once the corresponding
/// event actually happens (spec §4.1).
pub type After = Box<dyn FnOnce(HookOutcome) + Send>;

/// Observer hook families (spec §4.1 "every-call, first-call, before-behavior,
/// before-custom-action"). Observer failures are captured by the executor and
/// never abort the pipeline (spec §4.1, §7).
pub trait Observer: Send + Sync {
    /// Called on every check-in, cached or not.
    fn every_call(&self, node_role: &str) -> After {
        let _ = node_role;
        Box::new(|_| {})
    }

    /// Called only the first time a node runs its pipeline (i.e. on a cache
    /// miss, before priming starts).
    fn first_call(&self, node_role: &str) -> After {
        let _ = node_role;
        Box::new(|_| {})
    }

    /// Called immediately before the behavior phase runs.
    fn before_behavior(&self, node_role: &str) -> After {
        let _ = node_role;
        Box::new(|_| {})
    }

    /// Called immediately before a custom-action's cancel action is invoked.
    fn before_custom_action(&self, node_role: &str) -> After {
        let _ = node_role;
        Box::new(|_| {})
    }
}

/// The allocation-free default: every hook is a no-op.
pub struct NullObserver;

impl Observer for NullObserver {}

/// Run an "after" closure, catching a panicking observer so it never aborts
/// the pipeline (spec §4.1 "observer failures are captured ... and never
/// abort the pipeline"). Returns the failure to record into the call's
/// unhandled-exception list (spec §4.5 FinalState) when the hook panicked.
pub(crate) fn run_after(after: After, outcome: HookOutcome, node_role: &str) -> Option<FailureChain> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| after(outcome))) {
        Ok(()) => None,
        Err(payload) => {
            let detail = panic_message(&payload);
            tracing::warn!(node = node_role, detail = %detail, "observer hook panicked");
            Some(observer_failure(node_role, detail))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Build an observer failure (spec §4.1, §7).
fn observer_failure(node_role: &str, detail: impl Into<String>) -> FailureChain {
    FailureChain::from_encountered(crate::error::EncounteredError::new(format!(
        "observer hook failed for node '{}': {}",
        node_role,
        detail.into()
    )))
}

pub(crate) type ObserverHandle = Arc<dyn Observer>;
