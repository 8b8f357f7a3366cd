use std::fmt::{Display, Formatter};
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use petgraph::stable_graph::{NodeIndex, StableGraph};
use smallvec::SmallVec;

use crate::core::{AsyncState, TaskMeta};

/// Stable handle to a node of the graph.
///
/// Keys survive renumbering and reordering of the node sequence. A key whose
/// node has been deleted is stale; using it panics instead of silently
/// reaching a node that reused the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    index: NodeIndex,
    stamp: u64,
}

impl NodeKey {
    /// Storage slot of the node. Slots of deleted nodes are reused.
    pub fn index(&self) -> usize {
        self.index.index()
    }
}

pub(crate) type NeighborSet = SmallVec<[NodeKey; 8]>;

/// Per-state adjacency of a node.
///
/// Tasks touch a handful of states, so this is a short inline vector scanned
/// linearly rather than a hash map. Insertion order is preserved, which keeps
/// iteration (and the DOT dump) deterministic.
#[derive(Debug, Clone, Default)]
pub struct StateToNodes {
    entries: SmallVec<[(AsyncState, NeighborSet); 4]>,
}

impl StateToNodes {
    /// Neighbors connected through `state`.
    pub fn get(&self, state: AsyncState) -> &[NodeKey] {
        self.entries
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, nodes)| nodes.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, state: AsyncState, key: NodeKey) -> bool {
        self.get(state).contains(&key)
    }

    /// Iterates `(state, neighbors)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (AsyncState, &[NodeKey])> {
        self.entries
            .iter()
            .map(|(state, nodes)| (*state, nodes.as_slice()))
    }

    /// Every neighbor, once per state it is connected through.
    pub fn neighbors(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.entries.iter().flat_map(|(_, nodes)| nodes.iter().copied())
    }

    /// Number of states with at least one neighbor.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of `(state, neighbor)` pairs.
    pub fn edge_count(&self) -> usize {
        self.entries.iter().map(|(_, nodes)| nodes.len()).sum()
    }

    /// Returns `false` if the pair was already present.
    pub(crate) fn insert(&mut self, state: AsyncState, key: NodeKey) -> bool {
        let nodes = self.get_or_insert(state);
        if nodes.contains(&key) {
            return false;
        }
        nodes.push(key);
        true
    }

    pub(crate) fn get_or_insert(&mut self, state: AsyncState) -> &mut NeighborSet {
        let position = match self.entries.iter().position(|(s, _)| *s == state) {
            Some(position) => position,
            None => {
                self.entries.push((state, NeighborSet::new()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[position].1
    }

    /// Removes the pair, dropping the state entirely once it has no neighbors.
    pub(crate) fn remove(&mut self, state: AsyncState, key: NodeKey) -> bool {
        let Some(position) = self.entries.iter().position(|(s, _)| *s == state) else {
            return false;
        };

        let nodes = &mut self.entries[position].1;
        let before = nodes.len();
        nodes.retain(|k| *k != key);
        let removed = nodes.len() != before;

        if nodes.is_empty() {
            self.entries.remove(position);
        }

        removed
    }

    /// Removes `key` from every state.
    pub(crate) fn remove_node(&mut self, key: NodeKey) {
        self.retain_nodes(|k| k != key);
    }

    pub(crate) fn retain_nodes(&mut self, mut keep: impl FnMut(NodeKey) -> bool) {
        for (_, nodes) in self.entries.iter_mut() {
            nodes.retain(|k| keep(*k));
        }
        self.entries.retain(|(_, nodes)| !nodes.is_empty());
    }

    /// Replaces `from` with `to` everywhere, without creating duplicates.
    pub(crate) fn replace_node(&mut self, from: NodeKey, to: NodeKey) {
        for (_, nodes) in self.entries.iter_mut() {
            if let Some(position) = nodes.iter().position(|k| *k == from) {
                if nodes.contains(&to) {
                    nodes.remove(position);
                } else {
                    nodes[position] = to;
                }
            }
        }
    }

    /// Detaches and returns the neighbors of `state`.
    pub(crate) fn take(&mut self, state: AsyncState) -> NeighborSet {
        match self.entries.iter().position(|(s, _)| *s == state) {
            Some(position) => self.entries.remove(position).1,
            None => NeighborSet::new(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn into_entries(self) -> impl Iterator<Item = (AsyncState, NeighborSet)> {
        self.entries.into_iter()
    }
}

/// One scheduled task instance.
#[derive(Debug, Clone)]
pub struct Node<R> {
    pub(crate) rec: Option<R>,
    pub(crate) meta: Arc<TaskMeta>,
    pub(crate) launch_id: usize,
    stamp: u64,
    pub(crate) node_id: usize,
    pub(crate) pending_node_id: Option<usize>,
    pub(crate) seq: u64,
    pub(crate) is_initial_node: bool,
    pub(crate) input_edges: StateToNodes,
    pub(crate) output_edges: StateToNodes,
}

impl<R> Node<R> {
    pub(crate) fn new(rec: R, meta: Arc<TaskMeta>, launch_id: usize) -> Self {
        Self {
            rec: Some(rec),
            meta,
            launch_id,
            stamp: 0,
            node_id: 0,
            pending_node_id: Some(0),
            seq: 0,
            is_initial_node: false,
            input_edges: StateToNodes::default(),
            output_edges: StateToNodes::default(),
        }
    }

    /// The sentinel owning the "no prior writer" condition of every state.
    pub(crate) fn initial(meta: Arc<TaskMeta>) -> Self {
        Self {
            rec: None,
            meta,
            launch_id: 0,
            stamp: 0,
            node_id: 0,
            pending_node_id: None,
            seq: 0,
            is_initial_node: true,
            input_edges: StateToNodes::default(),
            output_edges: StateToNodes::default(),
        }
    }

    /// The launch record. `None` for the initial node and for executed nodes,
    /// whose records were handed to the executor.
    pub fn rec(&self) -> Option<&R> {
        self.rec.as_ref()
    }

    pub fn meta(&self) -> &Arc<TaskMeta> {
        &self.meta
    }

    /// The i-th launch of this task name.
    pub fn launch_id(&self) -> usize {
        self.launch_id
    }

    /// Position in the full node sequence. Only valid until the next
    /// structural change; see [`StateFlowGraph::reid_nodes`](crate::StateFlowGraph::reid_nodes).
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    /// Position among the pending nodes, `None` once executed.
    pub fn pending_node_id(&self) -> Option<usize> {
        self.pending_node_id
    }

    pub fn is_initial_node(&self) -> bool {
        self.is_initial_node
    }

    pub fn pending(&self) -> bool {
        self.pending_node_id.is_some()
    }

    pub fn executed(&self) -> bool {
        self.pending_node_id.is_none()
    }

    pub(crate) fn mark_executed(&mut self) {
        self.pending_node_id = None;
    }

    pub fn input_edges(&self) -> &StateToNodes {
        &self.input_edges
    }

    pub fn output_edges(&self) -> &StateToNodes {
        &self.output_edges
    }

    /// Whether an edge from this node to `destination` on `state` carries
    /// data (a flow edge) rather than ordering only (a dependency edge).
    ///
    /// Read-after-write gives a flow edge, write-after-write and
    /// write-after-read give dependency edges. So an edge is a flow edge iff
    /// the destination reads the state.
    pub fn has_state_flow<T>(&self, state: AsyncState, destination: &Node<T>) -> bool {
        destination.meta.input_states.contains(&state)
    }

    /// Whether this node writes `state`. The initial node counts as the
    /// writer of every state's initial contents.
    pub fn writes(&self, state: AsyncState) -> bool {
        self.is_initial_node || self.meta.output_states.contains(&state)
    }
}

impl<R> Display for Node<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[node: {}:{}]", self.meta.name, self.launch_id)
    }
}

/// Exclusive owner of every node.
///
/// Nodes are the weights of a [`StableGraph`], so indices survive removals.
/// Freed indices are reused, so every node also carries a stamp that has to
/// match the key's.
pub(crate) struct NodeStore<R> {
    graph: StableGraph<Node<R>, ()>,
    next_stamp: u64,
}

impl<R> Default for NodeStore<R> {
    fn default() -> Self {
        Self {
            graph: StableGraph::new(),
            next_stamp: 0,
        }
    }
}

impl<R> NodeStore<R> {
    pub(crate) fn insert(&mut self, mut node: Node<R>) -> NodeKey {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        node.stamp = stamp;

        NodeKey {
            index: self.graph.add_node(node),
            stamp,
        }
    }

    pub(crate) fn remove(&mut self, key: NodeKey) -> Node<R> {
        assert!(self.contains(key), "stale node key {key:?}");
        self.graph
            .remove_node(key.index)
            .unwrap_or_else(|| panic!("node {key:?} already removed"))
    }

    pub(crate) fn get(&self, key: NodeKey) -> Option<&Node<R>> {
        self.graph
            .node_weight(key.index)
            .filter(|node| node.stamp == key.stamp)
    }

    pub(crate) fn contains(&self, key: NodeKey) -> bool {
        self.get(key).is_some()
    }
}

impl<R> Index<NodeKey> for NodeStore<R> {
    type Output = Node<R>;

    fn index(&self, key: NodeKey) -> &Self::Output {
        self.get(key)
            .unwrap_or_else(|| panic!("stale node key {key:?}"))
    }
}

impl<R> IndexMut<NodeKey> for NodeStore<R> {
    fn index_mut(&mut self, key: NodeKey) -> &mut Self::Output {
        self.graph
            .node_weight_mut(key.index)
            .filter(|node| node.stamp == key.stamp)
            .unwrap_or_else(|| panic!("stale node key {key:?}"))
    }
}
