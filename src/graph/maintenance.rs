use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rayon::prelude::*;

use crate::core::{AsyncState, TaskBank};
use crate::error::VerifyError;
use crate::graph::{NodeKey, StateFlowGraph};

impl<B: TaskBank> StateFlowGraph<B> {
    /// Deletes the pending nodes at the given node ids.
    ///
    /// Ordering carried by a deleted node is kept: its predecessors on each
    /// state are linked to its successors on the same state, and ownership of
    /// the states it wrote falls back to the writer before it.
    ///
    /// # Panics
    /// Panics if any of the ids names an executed node.
    pub fn delete_nodes(&mut self, node_ids: &BTreeSet<usize>) {
        if node_ids.is_empty() {
            return;
        }

        let doomed: HashSet<NodeKey> = node_ids
            .iter()
            .map(|&id| {
                let key = self.order[id];
                assert!(
                    self.nodes[key].pending(),
                    "cannot delete executed node {}",
                    self.nodes[key]
                );
                key
            })
            .collect();

        let reassigned: Vec<(AsyncState, NodeKey)> = self
            .latest_state_owner
            .iter()
            .filter(|(_, owner)| doomed.contains(owner))
            .map(|(&state, &owner)| (state, self.prior_writer(owner, state, &doomed)))
            .collect();

        for (state, owner) in reassigned {
            self.latest_state_owner.insert(state, owner);
        }

        for &id in node_ids {
            let key = self.order[id];
            let inputs = std::mem::take(&mut self.nodes[key].input_edges);
            let outputs = std::mem::take(&mut self.nodes[key].output_edges);

            for (state, preds) in inputs.iter() {
                for &pred in preds {
                    self.nodes[pred].output_edges.remove(state, key);
                }
            }
            for (state, succs) in outputs.iter() {
                for &succ in succs {
                    self.nodes[succ].input_edges.remove(state, key);
                }
            }

            for (state, preds) in inputs.iter() {
                for &pred in preds {
                    for &succ in outputs.get(state) {
                        self.insert_edge(pred, succ, state);
                    }
                }
            }

            self.latest_state_readers.remove_node(key);
            tracing::debug!("Deleting {}", self.nodes[key]);
        }

        self.order.retain(|key| !doomed.contains(key));
        for key in doomed {
            self.nodes.remove(key);
        }
        self.reid_nodes();
    }

    /// Makes every edge naming `a` name `b` instead.
    ///
    /// With `only_output_edges`, edges into `a` stay where they are and `a`
    /// keeps its place in the reader table. Latest ownership always moves.
    pub fn replace_reference(&mut self, a: NodeKey, b: NodeKey, only_output_edges: bool) {
        if a == b {
            return;
        }

        let outputs = std::mem::take(&mut self.nodes[a].output_edges);
        for (state, succs) in outputs.into_entries() {
            for succ in succs {
                self.nodes[succ].input_edges.remove(state, a);
                self.insert_edge(b, succ, state);
            }
        }

        if !only_output_edges {
            let inputs = std::mem::take(&mut self.nodes[a].input_edges);
            for (state, preds) in inputs.into_entries() {
                for pred in preds {
                    self.nodes[pred].output_edges.remove(state, a);
                    self.insert_edge(pred, b, state);
                }
            }
            self.latest_state_readers.replace_node(a, b);
        }

        for owner in self.latest_state_owner.values_mut() {
            if *owner == a {
                *owner = b;
            }
        }
    }

    /// Renumbers every node after its position in the sequence.
    pub fn reid_nodes(&mut self) {
        for (position, &key) in self.order.iter().enumerate() {
            let node = &mut self.nodes[key];
            node.node_id = position;
            node.pending_node_id = position.checked_sub(self.first_pending_task_index);
        }
    }

    pub fn reid_pending_nodes(&mut self) {
        let begin = self.first_pending_task_index;
        for (offset, &key) in self.order[begin..].iter().enumerate() {
            let node = &mut self.nodes[key];
            node.node_id = begin + offset;
            node.pending_node_id = Some(offset);
        }
    }

    /// Reorders the pending nodes so that every edge points forward.
    /// Among ready nodes the earliest inserted goes first.
    ///
    /// # Panics
    /// Panics if the pending nodes form a cycle.
    pub fn topo_sort_nodes(&mut self) {
        let begin = self.first_pending_task_index;
        let pending: Vec<NodeKey> = self.order[begin..].to_vec();
        let position: HashMap<NodeKey, usize> =
            pending.iter().enumerate().map(|(i, &key)| (key, i)).collect();

        let mut in_degree = vec![0usize; pending.len()];
        let mut successors = Vec::with_capacity(pending.len());

        for &key in &pending {
            let mut targets: Vec<usize> = self.nodes[key]
                .output_edges
                .neighbors()
                .filter_map(|target| position.get(&target).copied())
                .collect();
            targets.sort_unstable();
            targets.dedup();

            for &target in &targets {
                in_degree[target] += 1;
            }
            successors.push(targets);
        }

        let mut ready: BinaryHeap<Reverse<(u64, usize)>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse((self.nodes[pending[i]].seq, i)))
            .collect();

        let mut sorted = Vec::with_capacity(pending.len());
        while let Some(Reverse((_, i))) = ready.pop() {
            sorted.push(pending[i]);
            for &target in &successors[i] {
                in_degree[target] -= 1;
                if in_degree[target] == 0 {
                    ready.push(Reverse((self.nodes[pending[target]].seq, target)));
                }
            }
        }

        assert_eq!(sorted.len(), pending.len(), "cycle among pending nodes");

        self.order.truncate(begin);
        self.order.extend(sorted);
        self.reid_pending_nodes();
    }

    /// Re-derives all pending edges by inserting the pending nodes again,
    /// topologically sorted first when `sort` is set.
    pub fn rebuild_graph(&mut self, sort: bool) {
        if sort {
            self.topo_sort_nodes();
        }

        for node in self.extract_pending_tasks() {
            self.insert_node(node);
        }
    }

    /// Rebuilds the graph `iterations` times and reports the time taken.
    pub fn benchmark_rebuild_graph(&mut self, iterations: usize) -> Duration {
        let start = Instant::now();
        for _ in 0..iterations {
            self.rebuild_graph(false);
        }
        let elapsed = start.elapsed();

        tracing::info!(
            "Rebuilt {} pending tasks {} times in {:?}",
            self.num_pending_tasks(),
            iterations,
            elapsed
        );
        elapsed
    }

    /// Checks the structural invariants of the graph.
    ///
    /// With `also_verify_ir`, the recorded state usage of every pending node
    /// is compared, in parallel, against a fresh analysis of its record.
    pub fn verify(&self, also_verify_ir: bool) -> Result<(), VerifyError> {
        let name = |key: NodeKey| self.nodes[key].to_string();

        match self.order.first() {
            Some(&first) if first == self.initial_node && self.nodes[first].is_initial_node => {}
            _ => return Err(VerifyError::MissingInitialNode),
        }

        for (position, &key) in self.order.iter().enumerate() {
            let node = &self.nodes[key];
            if node.node_id != position {
                return Err(VerifyError::NodeId {
                    node: name(key),
                    position,
                    node_id: node.node_id,
                });
            }

            let expected = position.checked_sub(self.first_pending_task_index);
            if node.pending_node_id != expected {
                return Err(VerifyError::PendingId {
                    node: name(key),
                    expected,
                    found: node.pending_node_id,
                });
            }
        }

        for &key in &self.order {
            let node = &self.nodes[key];

            for (state, targets) in node.output_edges.iter() {
                for &target in targets {
                    if !self.nodes.contains(target) {
                        return Err(VerifyError::DanglingEdge {
                            from: name(key),
                            to: format!("{target:?}"),
                            state,
                        });
                    }
                    if !self.nodes[target].input_edges.contains(state, key) {
                        return Err(VerifyError::MissingReciprocal {
                            from: name(key),
                            to: name(target),
                            state,
                        });
                    }
                }
            }

            for (state, sources) in node.input_edges.iter() {
                for &source in sources {
                    if !self.nodes.contains(source) {
                        return Err(VerifyError::DanglingEdge {
                            from: format!("{source:?}"),
                            to: name(key),
                            state,
                        });
                    }
                    if !self.nodes[source].output_edges.contains(state, key) {
                        return Err(VerifyError::MissingReciprocal {
                            from: name(source),
                            to: name(key),
                            state,
                        });
                    }
                }
            }
        }

        self.verify_acyclic()?;

        for &key in &self.order {
            let node = &self.nodes[key];

            if node.executed() {
                if let Some((state, &source)) = node
                    .input_edges
                    .iter()
                    .find_map(|(state, sources)| sources.first().map(|s| (state, s)))
                {
                    return Err(VerifyError::ExecutedEdge {
                        node: name(key),
                        other: name(source),
                        state,
                    });
                }
            }

            for (state, targets) in node.output_edges.iter() {
                for &target in targets {
                    let target_node = &self.nodes[target];
                    if node.executed() && target_node.executed() {
                        return Err(VerifyError::ExecutedEdge {
                            node: name(key),
                            other: name(target),
                            state,
                        });
                    }
                    if node.node_id >= target_node.node_id {
                        return Err(VerifyError::EdgeOrder {
                            from: name(key),
                            to: name(target),
                            state,
                        });
                    }
                }
            }
        }

        let mut owners: Vec<(AsyncState, NodeKey)> = self
            .latest_state_owner
            .iter()
            .map(|(&state, &owner)| (state, owner))
            .collect();
        owners.sort();

        for &(state, owner) in &owners {
            if !self.nodes.contains(owner) || !self.nodes[owner].writes(state) {
                return Err(VerifyError::OwnerNotWriter {
                    owner: format!("{owner:?}"),
                    state,
                });
            }
        }

        for (state, readers) in self.latest_state_readers.iter() {
            let owner = self.owner_or_initial(state);
            for &reader in readers {
                let linked = reader == owner
                    || (self.nodes.contains(reader)
                        && self.nodes[owner].output_edges.contains(state, reader));
                if !linked {
                    return Err(VerifyError::ReaderWithoutFlow {
                        reader: format!("{reader:?}"),
                        owner: name(owner),
                        state,
                    });
                }
            }
        }

        if also_verify_ir {
            self.verify_ir()?;
        }

        Ok(())
    }

    fn verify_acyclic(&self) -> Result<(), VerifyError> {
        let mut graph = DiGraph::<NodeKey, AsyncState>::with_capacity(self.order.len(), 0);
        let indices: HashMap<NodeKey, NodeIndex> = self
            .order
            .iter()
            .map(|&key| (key, graph.add_node(key)))
            .collect();

        for &key in &self.order {
            for (state, targets) in self.nodes[key].output_edges.iter() {
                for target in targets {
                    graph.add_edge(indices[&key], indices[target], state);
                }
            }
        }

        toposort(&graph, None).map(|_| ()).map_err(|cycle| VerifyError::Cycle {
            node: self.nodes[graph[cycle.node_id()]].to_string(),
        })
    }

    fn verify_ir(&self) -> Result<(), VerifyError> {
        let nodes = &self.nodes;
        let bank = &self.bank;

        let mismatch = self.pending_keys().par_iter().find_map_first(|&key| {
            let node = &nodes[key];
            let actual = bank.analyze(node.rec.as_ref()?)?;

            let check = |kind: &'static str, recorded: &BTreeSet<AsyncState>, actual: &BTreeSet<AsyncState>| {
                (recorded != actual).then(|| VerifyError::MetaMismatch {
                    node: node.to_string(),
                    kind,
                    recorded: recorded.iter().copied().collect(),
                    actual: actual.iter().copied().collect(),
                })
            };

            check("input", &node.meta.input_states, &actual.input_states)
                .or_else(|| check("output", &node.meta.output_states, &actual.output_states))
        });

        match mismatch {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
