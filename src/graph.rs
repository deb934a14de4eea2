//! [`Graph`] — a structurally-validated, reachable set of nodes (spec §4.6).
//!
//! Building a graph doesn't run anything; it walks every root's dependency
//! edges to collect the full reachable node set, then runs a pipeline of
//! [`GraphValidator`]s over that [`GraphCandidate`] before handing back an
//! immutable `Graph`. A `Graph` isn't required to open a [`crate::call::GraphCall`]
//! (any `Arc<Node<V>>` can be invoked directly), but running nodes through
//! validation first catches the structural mistakes spec §8's scenarios 7-8
//! describe before a single call ever executes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::memory::MemoryKindId;
use crate::node::{MemoryTarget, NodeDyn};
use crate::reply::NodeId;

/// The full reachable node set a [`GraphValidator`] inspects.
pub struct GraphCandidate {
    nodes: Vec<Arc<dyn NodeDyn>>,
}

impl GraphCandidate {
    pub fn nodes(&self) -> &[Arc<dyn NodeDyn>] {
        &self.nodes
    }
}

/// A structural check run once at graph-build time, before any call opens.
pub trait GraphValidator: Send + Sync {
    fn validate(&self, candidate: &GraphCandidate) -> std::result::Result<(), String>;
}

impl<F> GraphValidator for F
where
    F: Fn(&GraphCandidate) -> std::result::Result<(), String> + Send + Sync,
{
    fn validate(&self, candidate: &GraphCandidate) -> std::result::Result<(), String> {
        self(candidate)
    }
}

/// Every `new-memory` edge declares an ancestor relationship between two
/// memory kinds (the consumer's and the dependency's). Those relationships
/// must form a DAG — a memory kind can't end up its own ancestor, or
/// [`crate::memory::Memory::ancestor`] lookups would never terminate (spec
/// §4.4, §8 scenario 7).
pub fn ancestor_memory_relationships_acyclic(
    candidate: &GraphCandidate,
) -> std::result::Result<(), String> {
    let mut adjacency: HashMap<MemoryKindId, Vec<MemoryKindId>> = HashMap::new();
    for node in candidate.nodes() {
        for edge in &node.core().dependencies {
            if edge.memory_target == MemoryTarget::NewMemory {
                adjacency
                    .entry(node.core().memory_kind)
                    .or_default()
                    .push(edge.target.core().memory_kind);
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        kind: MemoryKindId,
        adjacency: &HashMap<MemoryKindId, Vec<MemoryKindId>>,
        marks: &mut HashMap<MemoryKindId, Mark>,
    ) -> std::result::Result<(), String> {
        match marks.get(&kind) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(format!(
                    "ancestor memory relationships form a cycle at memory kind '{}'",
                    kind.0
                ))
            }
            None => {}
        }
        marks.insert(kind, Mark::Visiting);
        if let Some(children) = adjacency.get(&kind) {
            for &child in children {
                visit(child, adjacency, marks)?;
            }
        }
        marks.insert(kind, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for &kind in adjacency.keys() {
        visit(kind, &adjacency, &mut marks)?;
    }
    Ok(())
}

/// A `same-memory` dependency edge runs its target against the consumer's own
/// memory, so the target must be bound to the same memory kind the consumer
/// is — otherwise the target's behavior would downcast the wrong input type
/// at runtime (spec §3 "memory kind"). This is a type-safety addition this
/// Rust rendition needs that the spec doesn't name separately, since the
/// original engine leans on a dynamically-typed host instead (DESIGN.md).
pub fn same_memory_edges_match_memory_kind(
    candidate: &GraphCandidate,
) -> std::result::Result<(), String> {
    for node in candidate.nodes() {
        for edge in &node.core().dependencies {
            if edge.memory_target == MemoryTarget::SameMemory
                && edge.target.core().memory_kind != node.core().memory_kind
            {
                return Err(format!(
                    "node '{}' (memory kind '{}') declares a same-memory dependency on \
                     '{}' bound to memory kind '{}'",
                    node.core().role,
                    node.core().memory_kind.0,
                    edge.target.core().role,
                    edge.target.core().memory_kind.0,
                ));
            }
        }
    }
    Ok(())
}

/// For every resource node a node declares itself the *envelope* of (via
/// [`crate::node::NodeBuilder::envelops`]), every other consumer of that
/// resource must also be a (direct or transitive) dependency of the
/// envelope — otherwise a consumer outside the envelope could still be
/// running (or yet to run) once the envelope node's own scope has closed the
/// resource, which is exactly the unsafe shape spec §4.6 / §8 scenario 8
/// rejects.
pub fn consumer_envelops_dependency(candidate: &GraphCandidate) -> std::result::Result<(), String> {
    let by_id: HashMap<NodeId, &Arc<dyn NodeDyn>> =
        candidate.nodes().iter().map(|n| (n.core().id, n)).collect();
    let dependency_closures: HashMap<NodeId, HashSet<NodeId>> = candidate
        .nodes()
        .iter()
        .map(|node| (node.core().id, transitive_dependency_ids(node, &by_id)))
        .collect();

    for envelope in candidate.nodes() {
        for &resource_id in &envelope.core().envelope_resources {
            let envelope_closure = &dependency_closures[&envelope.core().id];
            for consumer in candidate.nodes() {
                if consumer.core().id == envelope.core().id {
                    continue;
                }
                let consumes_resource = consumer
                    .core()
                    .dependencies
                    .iter()
                    .any(|edge| edge.target.core().id == resource_id);
                if consumes_resource && !envelope_closure.contains(&consumer.core().id) {
                    return Err(format!(
                        "node '{}' consumes the resource node enveloped by '{}', but is not \
                         itself (transitively) consumed by the envelope",
                        consumer.core().role,
                        envelope.core().role,
                    ));
                }
            }
        }
    }
    Ok(())
}

fn transitive_dependency_ids(
    node: &Arc<dyn NodeDyn>,
    by_id: &HashMap<NodeId, &Arc<dyn NodeDyn>>,
) -> HashSet<NodeId> {
    let mut seen = HashSet::new();
    let mut stack: Vec<NodeId> = node.core().dependencies.iter().map(|e| e.target.core().id).collect();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(n) = by_id.get(&id) {
            stack.extend(n.core().dependencies.iter().map(|e| e.target.core().id));
        }
    }
    seen
}

fn default_validators() -> Vec<Box<dyn GraphValidator>> {
    vec![
        Box::new(ancestor_memory_relationships_acyclic),
        Box::new(same_memory_edges_match_memory_kind),
        Box::new(consumer_envelops_dependency),
    ]
}

/// Graph-build configuration: which validators run before a [`Graph`] is
/// produced (SPEC_FULL.md §2 [ADDED] "Configuration"). Built with a small
/// builder, the way [`crate::node::NodeBuilder`] builds a [`crate::node::Node`]
/// — `GraphConfig::default()` runs the three built-in structural validators;
/// `with_validator` appends an application-specific one; `without_default_validators`
/// starts from an empty set for callers who want full control.
pub struct GraphConfig {
    validators: Vec<Box<dyn GraphValidator>>,
}

impl GraphConfig {
    /// The built-in validator set: `ancestor_memory_relationships_acyclic`,
    /// `same_memory_edges_match_memory_kind`, `consumer_envelops_dependency`.
    pub fn new() -> Self {
        Self {
            validators: default_validators(),
        }
    }

    /// Start from no validators at all, e.g. for a caller assembling its own
    /// validator set from scratch.
    pub fn without_default_validators() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    /// Append an application-specific structural check.
    pub fn with_validator(mut self, validator: impl GraphValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated, reachable set of nodes rooted at `roots` (spec §4.6). The only
/// way to obtain a `Graph` is through one of the `from_roots*` constructors,
/// every one of which runs its validator set before returning — holding a
/// `Graph` is itself the proof that validation happened (spec §8 properties
/// 7/8: "fails validation before a call can be opened").
pub struct Graph {
    roots: Vec<Arc<dyn NodeDyn>>,
    nodes: Vec<Arc<dyn NodeDyn>>,
    root_memory_kind: MemoryKindId,
}

impl Graph {
    /// Collect every node reachable from `roots` and validate the result with
    /// the built-in validators.
    pub fn from_roots(roots: Vec<Arc<dyn NodeDyn>>) -> Result<Self> {
        Self::from_roots_with_config(roots, GraphConfig::new())
    }

    /// Same as [`Graph::from_roots`] but with a caller-supplied validator set
    /// (e.g. to add application-specific structural checks).
    pub fn from_roots_with_validators(
        roots: Vec<Arc<dyn NodeDyn>>,
        validators: Vec<Box<dyn GraphValidator>>,
    ) -> Result<Self> {
        Self::build(roots, validators)
    }

    /// Same as [`Graph::from_roots`] but with an explicit [`GraphConfig`].
    pub fn from_roots_with_config(roots: Vec<Arc<dyn NodeDyn>>, config: GraphConfig) -> Result<Self> {
        Self::build(roots, config.validators)
    }

    fn build(roots: Vec<Arc<dyn NodeDyn>>, validators: Vec<Box<dyn GraphValidator>>) -> Result<Self> {
        if roots.is_empty() {
            return Err(GraphError::Validation("a graph must have at least one root node".to_string()));
        }

        let root_memory_kind = roots[0].core().memory_kind;
        for root in &roots {
            if root.core().memory_kind != root_memory_kind {
                return Err(GraphError::Validation(format!(
                    "root node '{}' is bound to memory kind '{}', but root '{}' is bound to \
                     '{}'; every root must share the call's own memory kind",
                    root.core().role,
                    root.core().memory_kind.0,
                    roots[0].core().role,
                    root_memory_kind.0,
                )));
            }
        }

        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut nodes = Vec::new();
        let mut stack: Vec<Arc<dyn NodeDyn>> = roots.clone();
        while let Some(node) = stack.pop() {
            if !seen.insert(node.core().id) {
                continue;
            }
            for edge in &node.core().dependencies {
                stack.push(edge.target.clone());
            }
            nodes.push(node);
        }

        let candidate = GraphCandidate { nodes };
        for validator in &validators {
            validator
                .validate(&candidate)
                .map_err(GraphError::Validation)?;
        }

        Ok(Self {
            roots,
            nodes: candidate.nodes,
            root_memory_kind,
        })
    }

    pub fn roots(&self) -> &[Arc<dyn NodeDyn>] {
        &self.roots
    }

    /// The memory kind every root node (and therefore the call's root memory)
    /// is bound to — every root shares it, enforced at build time above.
    pub fn root_memory_kind(&self) -> MemoryKindId {
        self.root_memory_kind
    }

    pub fn nodes(&self) -> &[Arc<dyn NodeDyn>] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::Behavior;
    use crate::node::{NodeBuilder, Priming};

    #[test]
    fn rejects_same_memory_edge_to_a_different_memory_kind() {
        let leaf = NodeBuilder::new(
            "leaf",
            MemoryKindId("other"),
            Behavior::plain(|_device| Box::pin(async { Ok(1i32) })),
        )
        .build();
        let root = NodeBuilder::new(
            "root",
            MemoryKindId("root"),
            Behavior::plain(|_device| Box::pin(async { Ok(1i32) })),
        )
        .depends_on(&leaf, Priming::Primed)
        .build();

        let err = Graph::from_roots(vec![root as Arc<dyn NodeDyn>])
            .err()
            .expect("validation should reject mismatched memory kinds");
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn accepts_a_well_formed_graph() {
        let leaf = NodeBuilder::new(
            "leaf",
            MemoryKindId("root"),
            Behavior::plain(|_device| Box::pin(async { Ok(1i32) })),
        )
        .build();
        let root = NodeBuilder::new(
            "root",
            MemoryKindId("root"),
            Behavior::plain(|_device| Box::pin(async { Ok(2i32) })),
        )
        .depends_on(&leaf, Priming::Primed)
        .build();

        let graph = Graph::from_roots(vec![root as Arc<dyn NodeDyn>]).unwrap();
        assert_eq!(graph.nodes().len(), 2);
    }

    #[test]
    fn rejects_a_consumer_of_an_enveloped_resource_outside_the_envelope() {
        // resource <- stray_consumer (outside the envelope)
        // resource <- envelope_user <- envelope (envelope declares itself the
        // envelope of `resource`, and only consumes `envelope_user`, not
        // `stray_consumer`).
        let resource = NodeBuilder::new(
            "resource",
            MemoryKindId("root"),
            Behavior::plain(|_device| Box::pin(async { Ok(1i32) })),
        )
        .build();
        let stray_consumer = NodeBuilder::new(
            "stray_consumer",
            MemoryKindId("root"),
            Behavior::plain(|_device| Box::pin(async { Ok(1i32) })),
        )
        .depends_on(&resource, Priming::Primed)
        .build();
        let envelope_user = NodeBuilder::new(
            "envelope_user",
            MemoryKindId("root"),
            Behavior::plain(|_device| Box::pin(async { Ok(1i32) })),
        )
        .depends_on(&resource, Priming::Primed)
        .build();
        let envelope = NodeBuilder::new(
            "envelope",
            MemoryKindId("root"),
            Behavior::plain(|_device| Box::pin(async { Ok(1i32) })),
        )
        .depends_on(&envelope_user, Priming::Primed)
        .envelops(&resource)
        .build();

        let err = Graph::from_roots(vec![
            envelope as Arc<dyn NodeDyn>,
            stray_consumer as Arc<dyn NodeDyn>,
        ])
        .err()
        .expect("validation should reject a consumer outside the envelope");
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn accepts_an_envelope_that_consumes_every_resource_consumer() {
        let resource = NodeBuilder::new(
            "resource",
            MemoryKindId("root"),
            Behavior::plain(|_device| Box::pin(async { Ok(1i32) })),
        )
        .build();
        let inner_consumer = NodeBuilder::new(
            "inner_consumer",
            MemoryKindId("root"),
            Behavior::plain(|_device| Box::pin(async { Ok(1i32) })),
        )
        .depends_on(&resource, Priming::Primed)
        .build();
        let envelope = NodeBuilder::new(
            "envelope",
            MemoryKindId("root"),
            Behavior::plain(|_device| Box::pin(async { Ok(1i32) })),
        )
        .depends_on(&inner_consumer, Priming::Primed)
        .depends_on(&resource, Priming::Primed)
        .envelops(&resource)
        .build();

        let graph = Graph::from_roots(vec![envelope as Arc<dyn NodeDyn>]).unwrap();
        assert_eq!(graph.nodes().len(), 3);
    }
}
