use thiserror::Error;

use crate::core::AsyncState;

/// A broken structural invariant of the state flow graph.
///
/// These are programmer errors. They are reported by
/// [`StateFlowGraph::verify`](crate::StateFlowGraph::verify) and are never
/// expected on a healthy graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Node sequence does not start with the initial node")]
    MissingInitialNode,

    #[error("Node {node} sits at position {position} but has node_id {node_id}")]
    NodeId {
        node: String,
        position: usize,
        node_id: usize,
    },

    #[error("Node {node} has pending_node_id {found:?}, expected {expected:?}")]
    PendingId {
        node: String,
        expected: Option<usize>,
        found: Option<usize>,
    },

    #[error("Executed node {node} has an edge on {state} with executed node {other}")]
    ExecutedEdge {
        node: String,
        other: String,
        state: AsyncState,
    },

    #[error("Edge {from} -> {to} on {state} goes backwards in the node sequence")]
    EdgeOrder {
        from: String,
        to: String,
        state: AsyncState,
    },

    #[error("Edge {from} -> {to} on {state} is missing its reciprocal entry")]
    MissingReciprocal {
        from: String,
        to: String,
        state: AsyncState,
    },

    #[error("Edge {from} -> {to} on {state} points at a node outside the graph")]
    DanglingEdge {
        from: String,
        to: String,
        state: AsyncState,
    },

    #[error("Latest owner {owner} of {state} does not write it")]
    OwnerNotWriter { owner: String, state: AsyncState },

    #[error("Reader {reader} of {state} has no flow edge from latest owner {owner}")]
    ReaderWithoutFlow {
        reader: String,
        owner: String,
        state: AsyncState,
    },

    #[error("Cycle detected through node {node}")]
    Cycle { node: String },

    #[error("Node {node} records {kind} states {recorded:?} but its IR uses {actual:?}")]
    MetaMismatch {
        node: String,
        kind: &'static str,
        recorded: Vec<AsyncState>,
        actual: Vec<AsyncState>,
    },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Executor failed:\n{0}")]
    Execute(anyhow::Error),

    #[error("Couldn't write the graph dump.\n{0}")]
    DotDump(#[from] std::io::Error),

    #[error("Launch queue is disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse scheduler config.\n{0}")]
    Parse(#[from] serde_json::Error),
}
