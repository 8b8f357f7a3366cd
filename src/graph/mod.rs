//! The state flow graph.
//!
//! Every launched task becomes a [`Node`]. Nodes are connected by edges
//! labelled with the [`AsyncState`] that motivated them: a node reading a
//! state depends on the latest writer of that state, and a node writing a
//! state depends on the latest writer and on every reader since.
//!
//! ## Layout
//!
//! Nodes live in a `petgraph` stable graph and are referenced everywhere by [`NodeKey`]s. The
//! node sequence is an ordered list of keys. Its first entry is always the
//! initial node, which stands in for the initial contents of every state.
//! The sequence is split into an executed prefix and a pending suffix; only
//! pending nodes are rewritten.
//!
//! ## Rewrites
//!
//! Rewrite passes live in their own modules (`fusion`, `passes`) and graph
//! upkeep in `maintenance`. After any structural change `node_id` and
//! `pending_node_id` are refreshed before the pass returns.

mod closure;
mod dot;
mod fusion;
mod maintenance;
mod node;
mod passes;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::{AsyncState, SNodeId, StateKind, TaskBank, TaskMeta, TaskType};

pub use closure::Closure;
pub use dot::DotGraph;
pub use node::{Node, NodeKey, StateToNodes};

use node::NodeStore;

/// Default number of pending tasks considered together by [`StateFlowGraph::fuse`].
pub const DEFAULT_FUSION_WINDOW: usize = 64;

pub struct StateFlowGraph<B: TaskBank> {
    bank: B,
    nodes: NodeStore<B::Record>,
    order: Vec<NodeKey>,
    initial_node: NodeKey,
    first_pending_task_index: usize,
    latest_state_owner: HashMap<AsyncState, NodeKey>,
    latest_state_readers: StateToNodes,
    task_name_to_launch_ids: HashMap<String, usize>,
    list_up_to_date: HashMap<SNodeId, bool>,
    next_seq: u64,
    fusion_window: usize,
}

impl<B: TaskBank> StateFlowGraph<B> {
    pub fn new(bank: B) -> Self {
        let initial_meta = TaskMeta::new("initial_state", TaskType::Serial).into_shared();

        let mut nodes = NodeStore::default();
        let initial_node = nodes.insert(Node::initial(initial_meta));

        Self {
            bank,
            nodes,
            order: vec![initial_node],
            initial_node,
            first_pending_task_index: 1,
            latest_state_owner: HashMap::new(),
            latest_state_readers: StateToNodes::default(),
            task_name_to_launch_ids: HashMap::new(),
            list_up_to_date: HashMap::new(),
            next_seq: 1,
            fusion_window: DEFAULT_FUSION_WINDOW,
        }
    }

    pub fn bank(&self) -> &B {
        &self.bank
    }

    /// Sets how many consecutive pending tasks [`fuse`](Self::fuse) analyzes
    /// at once. The closure costs grow quadratically with this number.
    pub fn set_fusion_window(&mut self, window: usize) {
        self.fusion_window = window.max(2);
    }

    pub fn initial_node(&self) -> NodeKey {
        self.initial_node
    }

    /// Returns the node behind `key`.
    ///
    /// # Panics
    /// Panics if the node has been deleted.
    pub fn node(&self, key: NodeKey) -> &Node<B::Record> {
        &self.nodes[key]
    }

    /// Returns the key of the node at `node_id` in the full sequence.
    pub fn key_at(&self, node_id: usize) -> NodeKey {
        self.order[node_id]
    }

    /// Keys of the full node sequence, executed prefix first.
    pub fn node_keys(&self) -> &[NodeKey] {
        &self.order
    }

    pub(crate) fn pending_keys(&self) -> &[NodeKey] {
        &self.order[self.first_pending_task_index..]
    }

    pub fn get_pending_tasks(&self) -> Vec<&Node<B::Record>> {
        self.pending_keys().iter().map(|&key| &self.nodes[key]).collect()
    }

    /// Returns `get_pending_tasks()[begin..end]`.
    pub fn get_pending_tasks_range(&self, begin: usize, end: usize) -> Vec<&Node<B::Record>> {
        self.pending_keys()[begin..end]
            .iter()
            .map(|&key| &self.nodes[key])
            .collect()
    }

    pub fn size(&self) -> usize {
        self.order.len()
    }

    pub fn num_pending_tasks(&self) -> usize {
        self.order.len() - self.first_pending_task_index
    }

    pub fn first_pending_task_index(&self) -> usize {
        self.first_pending_task_index
    }

    /// The node holding the most recent write to `state`, if any task has
    /// written it since the graph was created.
    pub fn latest_state_owner(&self, state: AsyncState) -> Option<NodeKey> {
        self.latest_state_owner.get(&state).copied()
    }

    /// Nodes that read `state` since its latest write.
    pub fn latest_state_readers(&self, state: AsyncState) -> &[NodeKey] {
        self.latest_state_readers.get(state)
    }

    /// Whether the index list of `snode` is known to be current.
    pub fn is_list_up_to_date(&self, snode: SNodeId) -> bool {
        self.list_up_to_date.get(&snode).copied().unwrap_or(false)
    }

    fn next_launch_id(&mut self, name: &str) -> usize {
        let counter = self
            .task_name_to_launch_ids
            .entry(name.to_string())
            .or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Wraps a launch record into a fresh, unconnected node.
    pub fn new_node(&mut self, rec: B::Record) -> Node<B::Record> {
        let meta = self.bank.meta(&rec);
        let launch_id = self.next_launch_id(&meta.name);
        Node::new(rec, meta, launch_id)
    }

    /// Inserts the launch records in order and wires their dependencies.
    ///
    /// Every task writing a mask, allocator or list marks the lists below it
    /// dirty. With `filter_listgen`, list generations whose target list is
    /// already up to date are dropped. Returns the number of nodes inserted.
    pub fn insert_tasks<I>(&mut self, records: I, filter_listgen: bool) -> usize
    where
        I: IntoIterator<Item = B::Record>,
    {
        let mut inserted = 0;

        for rec in records {
            let meta = self.bank.meta(&rec);

            if meta.task_type == TaskType::Listgen {
                if filter_listgen && let Some(snode) = meta.snode {
                    let up_to_date = self.list_up_to_date.entry(snode).or_insert(false);
                    if *up_to_date {
                        tracing::debug!("Skipping listgen {}: list is up to date", meta.name);
                        continue;
                    }
                    *up_to_date = true;
                }
            } else {
                let dirtied: Vec<SNodeId> = meta
                    .output_states
                    .iter()
                    .filter(|state| {
                        matches!(
                            state.kind,
                            StateKind::Mask | StateKind::Allocator | StateKind::List
                        )
                    })
                    .filter_map(|state| state.snode())
                    .collect();

                for snode in dirtied {
                    self.mark_list_as_dirty(snode);
                }
            }

            let launch_id = self.next_launch_id(&meta.name);
            self.insert_node(Node::new(rec, meta, launch_id));
            inserted += 1;
        }

        inserted
    }

    /// Appends a node to the pending sequence and wires its edges.
    pub fn insert_node(&mut self, mut node: Node<B::Record>) -> NodeKey {
        node.input_edges.clear();
        node.output_edges.clear();
        node.is_initial_node = false;
        node.seq = self.next_seq();
        node.node_id = self.order.len();
        node.pending_node_id = Some(self.order.len() - self.first_pending_task_index);

        let meta = Arc::clone(&node.meta);
        let key = self.nodes.insert(node);
        self.order.push(key);

        // Read-after-write
        for &state in &meta.input_states {
            let owner = self.owner_or_initial(state);
            self.insert_edge(owner, key, state);
        }

        for &state in &meta.output_states {
            // Write-after-write
            let owner = self.owner_or_initial(state);
            self.insert_edge(owner, key, state);

            // Write-after-read
            for reader in self.latest_state_readers.take(state) {
                self.insert_edge(reader, key, state);
            }

            self.latest_state_owner.insert(state, key);
        }

        // Must come after the output states, or a task would depend on itself.
        for &state in &meta.input_states {
            self.latest_state_readers.insert(state, key);
        }

        key
    }

    /// Connects `from -> to` through `state`. Repeated calls are no-ops.
    pub fn insert_edge(&mut self, from: NodeKey, to: NodeKey, state: AsyncState) {
        if from == to {
            return;
        }
        self.nodes[from].output_edges.insert(state, to);
        self.nodes[to].input_edges.insert(state, from);
    }

    fn owner_or_initial(&self, state: AsyncState) -> NodeKey {
        self.latest_state_owner
            .get(&state)
            .copied()
            .unwrap_or(self.initial_node)
    }

    /// Recursively marks as dirty the list of `snode` and of all its
    /// descendants.
    pub fn mark_list_as_dirty(&mut self, snode: SNodeId) {
        let mut worklist = vec![snode];
        let mut seen = HashSet::new();

        while let Some(current) = worklist.pop() {
            if !seen.insert(current) {
                continue;
            }
            self.list_up_to_date.insert(current, false);
            worklist.extend(self.bank.snode_children(current));
        }
    }

    /// Removes the pending nodes from the graph and returns them, disconnected.
    ///
    /// State ownership falls back to the last executed writer, so inserting
    /// the returned nodes again reproduces the same dependencies.
    pub fn extract_pending_tasks(&mut self) -> Vec<Node<B::Record>> {
        let keys: Vec<NodeKey> = self.order.drain(self.first_pending_task_index..).collect();
        let pending: HashSet<NodeKey> = keys.iter().copied().collect();

        let fallback: Vec<(AsyncState, NodeKey)> = self
            .latest_state_owner
            .iter()
            .filter(|(_, owner)| pending.contains(owner))
            .map(|(&state, &owner)| (state, self.prior_writer(owner, state, &pending)))
            .collect();

        for (state, owner) in fallback {
            self.latest_state_owner.insert(state, owner);
        }

        for &key in &self.order {
            self.nodes[key].output_edges.retain_nodes(|k| !pending.contains(&k));
        }
        self.latest_state_readers.retain_nodes(|k| !pending.contains(&k));

        keys.into_iter()
            .map(|key| {
                let mut node = self.nodes.remove(key);
                node.input_edges.clear();
                node.output_edges.clear();
                node
            })
            .collect()
    }

    /// The writer of `state` that `key` overwrote or read from, skipping nodes
    /// in `skip`. Falls back to the initial node.
    pub(crate) fn prior_writer(
        &self,
        key: NodeKey,
        state: AsyncState,
        skip: &HashSet<NodeKey>,
    ) -> NodeKey {
        let mut current = key;

        loop {
            let previous = self.nodes[current]
                .input_edges
                .get(state)
                .iter()
                .copied()
                .filter(|&k| self.nodes[k].writes(state))
                .max_by_key(|&k| self.nodes[k].node_id);

            match previous {
                Some(previous) if skip.contains(&previous) => current = previous,
                Some(previous) => return previous,
                None => return self.initial_node,
            }
        }
    }

    /// Moves every pending node into the executed prefix.
    ///
    /// The history only keeps the initial node and the executed nodes that
    /// still own the latest write of some state; everything else is ordered
    /// already and dropped. Executed nodes keep no edges among themselves.
    pub fn mark_pending_tasks_as_executed(&mut self) {
        let owners: HashSet<NodeKey> = self.latest_state_owner.values().copied().collect();

        let mut kept = Vec::with_capacity(owners.len() + 1);
        for key in std::mem::take(&mut self.order) {
            let keep = self.nodes[key].is_initial_node || owners.contains(&key);
            if keep {
                kept.push(key);
            } else {
                self.nodes.remove(key);
            }
        }

        for &key in &kept {
            let node = &mut self.nodes[key];
            node.input_edges.clear();
            node.output_edges.clear();
            node.mark_executed();
        }

        self.latest_state_readers.clear();
        self.order = kept;
        self.first_pending_task_index = self.order.len();
        self.reid_nodes();
    }

    /// Hands the pending tasks over for execution.
    ///
    /// Returns their launch records in an order where every edge's source
    /// precedes its destination, then marks them executed.
    pub fn extract_to_execute(&mut self) -> Vec<B::Record> {
        self.topo_sort_nodes();

        let keys: Vec<NodeKey> = self.pending_keys().to_vec();
        let records: Vec<B::Record> = keys
            .into_iter()
            .filter_map(|key| self.nodes[key].rec.take())
            .collect();

        self.mark_pending_tasks_as_executed();
        records
    }

    /// Drops every node except the initial one.
    ///
    /// Launch id counters and the list currency cache survive, since they
    /// describe the program rather than the graph.
    pub fn clear(&mut self) {
        let removed: Vec<NodeKey> = self.order.drain(1..).collect();
        for key in removed {
            self.nodes.remove(key);
        }

        let initial = &mut self.nodes[self.initial_node];
        initial.input_edges.clear();
        initial.output_edges.clear();

        self.latest_state_owner.clear();
        self.latest_state_readers.clear();
        self.first_pending_task_index = 1;
        self.reid_nodes();
    }

    /// Logs every node and its edges.
    pub fn print(&self) {
        tracing::info!("=== State Flow Graph ===");

        for &key in &self.order {
            let node = &self.nodes[key];
            tracing::info!("{}", node);

            for (state, sources) in node.input_edges.iter() {
                for &source in sources {
                    tracing::info!("    <- {} on {}", self.nodes[source], state);
                }
            }

            for (state, targets) in node.output_edges.iter() {
                for &target in targets {
                    let flow = if node.has_state_flow(state, &self.nodes[target]) {
                        "flow"
                    } else {
                        "dependency"
                    };
                    tracing::info!("    -> {} on {} ({})", self.nodes[target], state, flow);
                }
            }
        }

        tracing::info!("=======================");
    }
}
