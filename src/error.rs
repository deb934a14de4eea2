//! Error types for graph construction and execution.
//!
//! # Error Hierarchy
//!
//! ```text
//! GraphError
//! ├── Validation          - graph structure failed a validator at build time
//! ├── NodeExecution       - a node's behavior failed, carrying the canonical chain
//! ├── LifecycleViolation  - a call/device was used after it stopped accepting work
//! ├── ObserverFailure     - an observer hook panicked/errored (never fatal)
//! └── Custom              - application-defined escape hatch
//! ```
//!
//! The interesting error shape in this crate is not `GraphError` itself but
//! [`FailureChain`], the three-layer canonical form every failed [`crate::reply::Reply`]
//! carries (see spec §3, §7): an outer container, a call-stack decoration, and the
//! encountered cause. `GraphError::NodeExecution` simply carries one of these.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Convenience result type for graph construction.
pub type Result<T> = std::result::Result<T, GraphError>;

/// The thing a behavior actually threw or returned as a failure.
///
/// This is deliberately an owned, cheaply-clonable type rather than
/// `Box<dyn std::error::Error>` — replies are memoized and may be read by many
/// consumers, so the encountered cause must be shareable without re-running
/// anything.
#[derive(Debug, Clone)]
pub struct EncounteredError(pub Arc<str>);

impl EncounteredError {
    pub fn new(msg: impl Into<Arc<str>>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for EncounteredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for EncounteredError {}

/// One frame of the calling node-stack attached by [`FailureChain::decorate`].
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub node_role: Arc<str>,
}

/// The canonical three-layer failure chain carried by every failed [`crate::reply::Reply`].
///
/// * `encountered` — the thing the behavior actually produced or threw.
/// * `call_stack` — the node roles the failure was re-raised through, innermost first.
/// * `suppressed` — sibling primed-dependency failures attached when the exception
///   strategy is `suppress` (spec §7).
///
/// The outer "container exception" of spec §3 is this struct itself: constructing
/// one *is* wrapping the encountered error in a container. `first_non_container`
/// is the accessor that strips back down to `encountered`.
#[derive(Debug, Clone)]
pub struct FailureChain {
    pub encountered: EncounteredError,
    pub call_stack: Vec<CallFrame>,
    pub suppressed: Vec<FailureChain>,
    /// The reply this chain was first read from, set the first time a
    /// consumer observes it via [`crate::reply::Reply::get`]. Lets the
    /// executor recognize "the primed dependency whose failure the behavior
    /// just re-raised" so it isn't also attached to itself as a suppressed
    /// sibling (spec §4.1 / §7 scenario in spec §8.4).
    pub origin: Option<crate::reply::ReplyKey>,
}

impl FailureChain {
    /// Construct a fresh chain from a behavior's own failure — this is the point
    /// at which the encountered exception first becomes a container.
    pub fn from_encountered(encountered: EncounteredError) -> Self {
        Self {
            encountered,
            call_stack: Vec::new(),
            suppressed: Vec::new(),
            origin: None,
        }
    }

    /// Tag this chain with the reply it was read from, if not already tagged.
    pub(crate) fn with_origin_if_unset(mut self, key: crate::reply::ReplyKey) -> Self {
        if self.origin.is_none() {
            self.origin = Some(key);
        }
        self
    }

    /// Re-raise an already-canonical chain through `node_role`: the outer
    /// container is reused and `node_role` is pushed onto the call-stack, per
    /// spec §4.1 / §7 ("the executor reuses the same outer container").
    pub fn decorate(mut self, node_role: impl Into<Arc<str>>) -> Self {
        self.call_stack.push(CallFrame {
            node_role: node_role.into(),
        });
        self
    }

    /// Attach a sibling failure as a suppressed cause (exception-strategy
    /// `suppress`, spec §7). A no-op under `discard`.
    pub fn with_suppressed(mut self, other: FailureChain) -> Self {
        self.suppressed.push(other);
        self
    }

    /// The accessor that strips all container layers and returns the original,
    /// non-container cause (spec §3 / §7 "canonical way to inspect the original
    /// cause").
    pub fn first_non_container(&self) -> &EncounteredError {
        &self.encountered
    }

    /// The outer container view: the whole chain, for diagnostics.
    pub fn container(&self) -> &FailureChain {
        self
    }

    /// The call-stack decoration view: the accumulated node roles.
    pub fn call_stack(&self) -> &[CallFrame] {
        &self.call_stack
    }
}

impl fmt::Display for FailureChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encountered)?;
        for frame in self.call_stack.iter().rev() {
            write!(f, " (via {})", frame.node_role)?;
        }
        Ok(())
    }
}

impl std::error::Error for FailureChain {}

/// Comprehensive error type for graph construction and call-lifecycle misuse.
///
/// Node-execution failures normally live *inside* a [`crate::reply::Reply`] as a
/// [`FailureChain`] and never need to surface as a `GraphError` at all — a reply
/// is a value, not a `Result`. `GraphError::NodeExecution` exists for call sites
/// (like `invoke` on a root that the caller awaits directly) that want a single
/// `Result`-shaped return.
#[derive(Error, Debug, Clone)]
pub enum GraphError {
    /// A structural validator rejected the graph at build time (spec §4.6, §8.7-8).
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// A node's behavior failed; the chain is the canonical three-layer form.
    #[error("node '{node}' failed: {error}")]
    NodeExecution { node: Arc<str>, error: FailureChain },

    /// A call, device, or scope was used after it stopped accepting work
    /// (weakly-close enforcement, spec §4.4 / §9 "weakly" contracts). Reported,
    /// not fatal to already-outstanding work.
    #[error("lifecycle violation: {0}")]
    LifecycleViolation(String),

    /// An observer hook itself failed. Never aborts the pipeline; surfaced here
    /// only when explicitly converted for diagnostics (spec §4.1, §7).
    #[error("observer hook failed: {0}")]
    ObserverFailure(String),

    /// Escape hatch for application-defined validator/config errors.
    #[error("{0}")]
    Custom(String),
}

impl GraphError {
    pub fn node_execution(node: impl Into<Arc<str>>, error: FailureChain) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_non_container_strips_decoration() {
        let chain = FailureChain::from_encountered(EncounteredError::new("boom"))
            .decorate("consumer")
            .decorate("root");
        assert_eq!(chain.first_non_container().0.as_ref(), "boom");
        assert_eq!(chain.call_stack().len(), 2);
        assert_eq!(chain.call_stack()[1].node_role.as_ref(), "root");
    }

    #[test]
    fn suppressed_causes_are_attached_not_replacing() {
        let a = FailureChain::from_encountered(EncounteredError::new("a failed"));
        let b = FailureChain::from_encountered(EncounteredError::new("b failed"));
        let combined = a.with_suppressed(b);
        assert_eq!(combined.suppressed.len(), 1);
        assert_eq!(combined.first_non_container().0.as_ref(), "a failed");
    }
}
