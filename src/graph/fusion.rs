use std::collections::BTreeSet;
use std::sync::Arc;

use fixedbitset::FixedBitSet;

use crate::core::{Resource, StateKind, TaskBank, TaskMeta, TaskType};
use crate::graph::{Node, NodeKey, StateFlowGraph};

/// Whether running `second` inside the loop body of `first` keeps every
/// access hazard between them intact.
///
/// Serial tasks run their bodies in order, so any conflict is fine. Every
/// other task type is treated as parallel: iterations only stay ordered per
/// element, which covers conflicts on structures both tasks access
/// element-wise and nothing else.
fn hazard_free(first: &TaskMeta, second: &TaskMeta) -> bool {
    if first.task_type == TaskType::Serial {
        return true;
    }

    first
        .conflicts_with(second)
        .all(|state| match (state.resource, state.kind) {
            (Resource::SNode(snode), StateKind::Value | StateKind::Mask) => {
                first.element_wise.contains(&snode) && second.element_wise.contains(&snode)
            }
            _ => false,
        })
}

struct FusedGroup<R> {
    members: Vec<usize>,
    rec: R,
    meta: Arc<TaskMeta>,
}

impl<B: TaskBank> StateFlowGraph<B> {
    /// Greedily fuses pending nodes `begin..end`.
    ///
    /// Each group is materialized as a new pending node appended to the
    /// sequence, and every reference to a member is redirected to it. The
    /// members are left disconnected; their node ids are returned and the
    /// caller must delete them and rebuild the graph sorted.
    pub fn fuse_range(&mut self, begin: usize, end: usize) -> BTreeSet<usize> {
        let keys: Vec<NodeKey> = self.pending_keys()[begin..end].to_vec();
        let mut closure = self.compute_transitive_closure(begin, end);
        let mut absorbed = vec![false; keys.len()];
        let mut groups = Vec::new();

        for i in 0..keys.len() {
            if absorbed[i] {
                continue;
            }

            let leader = &self.nodes[keys[i]];
            if leader.meta.fusion.is_none() {
                continue;
            }
            let Some(mut rec) = leader.rec.clone() else {
                continue;
            };

            let mut meta = Arc::clone(&leader.meta);
            let mut members = vec![i];
            let mut member_set = FixedBitSet::with_capacity(keys.len());
            member_set.insert(i);

            for j in i + 1..keys.len() {
                if absorbed[j] {
                    continue;
                }

                let candidate = &self.nodes[keys[j]];
                if !meta.fusion_compatible(&candidate.meta) || !hazard_free(&meta, &candidate.meta) {
                    continue;
                }

                // The group would have to run both before and after j.
                if closure.has_path(j, i) {
                    continue;
                }

                if closure.has_path(i, j) {
                    let mut between = closure.descendants(i).clone();
                    between.intersect_with(closure.ancestors(j));
                    between.difference_with(&member_set);
                    between.set(j, false);
                    if !between.is_clear() {
                        continue;
                    }
                }

                let Some(candidate_rec) = candidate.rec.as_ref() else {
                    continue;
                };
                let Some(fused) = self.bank.fuse(&rec, candidate_rec) else {
                    continue;
                };
                let fused_meta = self.bank.meta(&fused);
                if fused_meta.fusion != meta.fusion {
                    continue;
                }

                tracing::debug!("Fusing {} into {}", candidate, leader);

                rec = fused;
                meta = fused_meta;
                members.push(j);
                member_set.insert(j);
                absorbed[j] = true;
                closure.merge(i, j);
            }

            if members.len() > 1 {
                groups.push(FusedGroup { members, rec, meta });
            }
        }

        let mut to_delete = BTreeSet::new();

        for group in groups {
            let member_keys: Vec<NodeKey> = group.members.iter().map(|&m| keys[m]).collect();
            let seq = member_keys
                .iter()
                .map(|&key| self.nodes[key].seq)
                .min()
                .unwrap_or(self.next_seq);

            let launch_id = self.next_launch_id(&group.meta.name);
            let mut node = Node::new(group.rec, group.meta, launch_id);
            node.seq = seq;
            node.node_id = self.order.len();
            node.pending_node_id = Some(self.order.len() - self.first_pending_task_index);

            let fused = self.nodes.insert(node);
            self.order.push(fused);

            for member in member_keys {
                to_delete.insert(self.nodes[member].node_id);
                self.replace_reference(member, fused, false);
            }
        }

        to_delete
    }

    /// Runs [`fuse_range`](Self::fuse_range) over consecutive windows of the
    /// pending tasks, then deletes the fused members and rebuilds.
    pub fn fuse(&mut self) -> bool {
        let pending = self.num_pending_tasks();
        let mut to_delete = BTreeSet::new();

        let mut begin = 0;
        while begin < pending {
            let end = (begin + self.fusion_window).min(pending);
            to_delete.extend(self.fuse_range(begin, end));
            begin = end;
        }

        if to_delete.is_empty() {
            return false;
        }

        let fused = self.num_pending_tasks() - pending;
        self.delete_nodes(&to_delete);
        self.rebuild_graph(true);

        tracing::debug!("Fused {} tasks into {}", to_delete.len(), fused);
        true
    }
}
