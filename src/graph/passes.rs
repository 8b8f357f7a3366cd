use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::core::{AsyncState, SNodeId, StateKind, TaskBank, TaskMeta, TaskType};
use crate::graph::{NodeKey, StateFlowGraph};

impl<B: TaskBank> StateFlowGraph<B> {
    /// Removes list generations that would rebuild a list nothing changed.
    ///
    /// A later listgen of the same SNode is redundant when each of its inputs
    /// comes from the same writer as for the earlier one, and the list itself
    /// was last written by the earlier one. Consumers of the redundant list
    /// are redirected to the surviving listgen.
    pub fn optimize_listgen(&mut self) -> bool {
        self.topo_sort_nodes();

        let mut by_snode: BTreeMap<SNodeId, Vec<NodeKey>> = BTreeMap::new();
        for &key in self.pending_keys() {
            let meta = &self.nodes[key].meta;
            if meta.task_type == TaskType::Listgen {
                if let Some(snode) = meta.snode {
                    by_snode.entry(snode).or_default().push(key);
                }
            }
        }

        let mut redirects = Vec::new();
        let mut to_delete = BTreeSet::new();

        for (snode, listgens) in by_snode {
            let list = AsyncState::list(snode);
            let mut survivor: Option<NodeKey> = None;
            let mut dropped = HashSet::new();

            for listgen in listgens {
                if let Some(survivor) = survivor {
                    if self.listgen_redundant(survivor, listgen, list, &dropped) {
                        tracing::debug!(
                            "Listgen {} is redundant with {}",
                            self.nodes[listgen],
                            self.nodes[survivor]
                        );
                        redirects.push((listgen, survivor));
                        to_delete.insert(self.nodes[listgen].node_id);
                        dropped.insert(listgen);
                        continue;
                    }
                }
                survivor = Some(listgen);
                dropped.clear();
            }
        }

        if to_delete.is_empty() {
            return false;
        }

        for (redundant, survivor) in redirects {
            self.replace_reference(redundant, survivor, true);
        }
        self.delete_nodes(&to_delete);
        self.rebuild_graph(false);

        tracing::debug!("Removed {} redundant listgens", to_delete.len());
        true
    }

    fn listgen_redundant(
        &self,
        earlier: NodeKey,
        later: NodeKey,
        list: AsyncState,
        dropped: &HashSet<NodeKey>,
    ) -> bool {
        let none = HashSet::new();
        let earlier_meta = &self.nodes[earlier].meta;
        let later_meta = &self.nodes[later].meta;

        if earlier_meta.input_states != later_meta.input_states {
            return false;
        }

        let same_inputs = later_meta.input_states.iter().all(|&state| {
            self.prior_writer(earlier, state, &none) == self.prior_writer(later, state, &none)
        });

        same_inputs && self.prior_writer(later, list, dropped) == earlier
    }

    /// Strips activations already performed by an earlier launch of the same
    /// task.
    ///
    /// Applies to parallel tasks whose mask write directly follows a launch of
    /// the same task type, with no other writer of the mask in between.
    pub fn demote_activation(&mut self) -> bool {
        let keys: Vec<NodeKey> = self.pending_keys().to_vec();
        let mut demoted = 0;

        for key in keys {
            let Some((rec, meta)) = self.find_demotion(key) else {
                continue;
            };

            let node = &mut self.nodes[key];
            tracing::debug!("Demoting activations of {}", node);
            node.rec = Some(rec);
            node.meta = meta;
            demoted += 1;
        }

        if demoted == 0 {
            return false;
        }

        self.rebuild_graph(false);
        tracing::debug!("Demoted activations of {} tasks", demoted);
        true
    }

    fn find_demotion(&self, key: NodeKey) -> Option<(B::Record, Arc<TaskMeta>)> {
        let node = &self.nodes[key];
        if !node.meta.task_type.is_parallel() {
            return None;
        }
        let rec = node.rec.as_ref()?;

        node.meta
            .output_states
            .iter()
            .filter(|state| state.kind == StateKind::Mask)
            .find_map(|&mask| {
                let mut writers = node
                    .input_edges
                    .get(mask)
                    .iter()
                    .copied()
                    .filter(|&k| self.nodes[k].writes(mask));

                let dominator = &self.nodes[writers.next()?];
                if writers.next().is_some()
                    || dominator.is_initial_node
                    || !Arc::ptr_eq(&dominator.meta, &node.meta)
                {
                    return None;
                }

                let demoted = self.bank.demote_activation(rec, dominator.rec.as_ref()?)?;
                let meta = self.bank.meta(&demoted);

                (!meta.output_states.contains(&mask)).then_some((demoted, meta))
            })
    }

    /// Removes writes nobody will ever observe.
    ///
    /// A state written by a pending node is dead when no edge out of the
    /// node on that state is a flow edge and the node is not its latest
    /// owner. Nodes whose writes are all dead are deleted; otherwise the bank
    /// may strip the dead stores from the record.
    pub fn optimize_dead_store(&mut self) -> bool {
        let keys: Vec<NodeKey> = self.pending_keys().to_vec();
        let mut to_delete = BTreeSet::new();
        let mut stripped = 0;

        for key in keys {
            let node = &self.nodes[key];
            if node.meta.has_side_effects || node.meta.output_states.is_empty() {
                continue;
            }
            let Some(rec) = node.rec.as_ref() else {
                continue;
            };

            let dead: BTreeSet<AsyncState> = node
                .meta
                .output_states
                .iter()
                .copied()
                .filter(|&state| self.is_dead_store(key, state))
                .collect();

            if dead.is_empty() {
                continue;
            }

            if dead.len() == node.meta.output_states.len() {
                tracing::debug!("Eliminating dead task {}", node);
                to_delete.insert(node.node_id);
                continue;
            }

            let Some(rec) = self.bank.eliminate_stores(rec, &dead) else {
                continue;
            };
            let meta = self.bank.meta(&rec);
            if meta.output_states == node.meta.output_states {
                continue;
            }

            let node = &mut self.nodes[key];
            tracing::debug!("Eliminating {} dead stores of {}", dead.len(), node);
            node.rec = Some(rec);
            node.meta = meta;
            stripped += 1;
        }

        if to_delete.is_empty() && stripped == 0 {
            return false;
        }

        let deleted = to_delete.len();
        self.delete_nodes(&to_delete);
        self.rebuild_graph(false);

        tracing::debug!("Dead store elimination: {} deleted, {} stripped", deleted, stripped);
        true
    }

    fn is_dead_store(&self, key: NodeKey, state: AsyncState) -> bool {
        let node = &self.nodes[key];
        if self.latest_state_owner.get(&state) == Some(&key) {
            return false;
        }

        !node
            .output_edges
            .get(state)
            .iter()
            .any(|&target| node.has_state_flow(state, &self.nodes[target]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::*;

    #[test]
    fn test_redundant_listgen_is_removed() {
        let root = SNodeId(0);
        let leaf = SNodeId(1);
        let mut graph = graph_with(vec![
            listgen("gen_leaf", leaf, root),
            struct_for("sum", leaf).reads(value(1)).writes(value(2)),
        ]);
        graph.insert_tasks(launches(&["gen_leaf", "sum", "gen_leaf", "sum", "gen_leaf"]), false);

        assert!(graph.optimize_listgen());
        assert_eq!(pending_names(&graph), vec!["gen_leaf", "sum", "sum"]);

        let survivor = graph.key_at(1);
        let second_sum = graph.key_at(3);
        assert!(graph.node(second_sum).input_edges().contains(list(leaf), survivor));
        assert_eq!(graph.latest_state_owner(list(leaf)), Some(survivor));
        assert_eq!(graph.verify(true), Ok(()));

        assert!(!graph.optimize_listgen());
    }

    #[test]
    fn test_listgen_after_activation_is_kept() {
        let root = SNodeId(0);
        let leaf = SNodeId(1);
        let mut graph = graph_with(vec![
            listgen("gen_leaf", leaf, root),
            TaskMeta::new("activate", TaskType::Serial).writes(mask(leaf)),
        ]);
        graph.insert_tasks(launches(&["gen_leaf", "activate", "gen_leaf"]), false);

        assert!(!graph.optimize_listgen());
        assert_eq!(graph.num_pending_tasks(), 3);
    }

    #[test]
    fn test_listgens_of_different_snodes_are_independent() {
        let root = SNodeId(0);
        let mut graph = graph_with(vec![
            listgen("gen_a", SNodeId(1), root),
            listgen("gen_b", SNodeId(2), root),
        ]);
        graph.insert_tasks(launches(&["gen_a", "gen_b"]), false);

        assert!(!graph.optimize_listgen());
    }

    #[test]
    fn test_demote_repeated_activation() {
        let leaf = SNodeId(1);
        let activate = || {
            range_for("activate")
                .reads(value(0))
                .writes(mask(leaf))
                .writes(value(1))
        };
        let mut graph = graph_with(vec![activate()]);
        graph.insert_tasks(launches(&["activate", "activate", "activate"]), false);

        // The third launch follows the second, which no longer matches.
        assert!(graph.demote_activation());
        assert!(graph.node(graph.key_at(2)).rec().unwrap().demoted);
        assert!(!graph.node(graph.key_at(3)).rec().unwrap().demoted);

        assert!(graph.demote_activation());
        assert!(graph.node(graph.key_at(3)).rec().unwrap().demoted);
        assert!(!graph.node(graph.key_at(1)).rec().unwrap().demoted);
        assert!(!graph.demote_activation());

        let third = graph.node(graph.key_at(3));
        assert!(!third.meta().output_states.contains(&mask(leaf)));
        assert_eq!(graph.latest_state_owner(mask(leaf)), Some(graph.key_at(1)));
        assert_eq!(graph.verify(true), Ok(()));
    }

    #[test]
    fn test_no_demotion_across_other_writer() {
        let leaf = SNodeId(1);
        let mut graph = graph_with(vec![
            range_for("activate").writes(mask(leaf)),
            TaskMeta::new("deactivate", TaskType::Serial).writes(mask(leaf)),
        ]);
        graph.insert_tasks(launches(&["activate", "deactivate", "activate"]), false);

        assert!(!graph.demote_activation());
    }

    #[test]
    fn test_serial_tasks_are_not_demoted() {
        let leaf = SNodeId(1);
        let mut graph = graph_with(vec![serial("activate").writes(mask(leaf))]);
        graph.insert_tasks(launches(&["activate", "activate"]), false);

        assert!(!graph.demote_activation());
    }

    #[test]
    fn test_overwritten_store_is_eliminated() {
        let x = value(0);
        let mut graph = graph_with(vec![serial("w").writes(x), serial("r").reads(x)]);
        graph.insert_tasks(launches(&["w", "w", "r"]), false);

        assert!(graph.optimize_dead_store());
        assert_eq!(pending_names(&graph), vec!["w", "r"]);
        assert_eq!(graph.node(graph.key_at(1)).launch_id(), 1);
        assert_eq!(graph.verify(true), Ok(()));
    }

    #[test]
    fn test_flow_edges_keep_writers_alive() {
        let x = value(0);
        let mut graph = graph_with(vec![serial("w").writes(x), serial("r").reads(x)]);
        graph.insert_tasks(launches(&["w", "r", "w"]), false);

        assert!(!graph.optimize_dead_store());
        assert_eq!(pending_names(&graph), vec!["w", "r", "w"]);
    }

    #[test]
    fn test_side_effects_and_owners_are_kept() {
        let x = value(0);
        let mut graph = graph_with(vec![
            serial("print").writes(x).with_side_effects(),
            serial("w").writes(x),
        ]);
        graph.insert_tasks(launches(&["print", "w"]), false);

        assert!(!graph.optimize_dead_store());
        assert_eq!(graph.num_pending_tasks(), 2);
    }

    #[test]
    fn test_partial_dead_store() {
        let x = value(0);
        let y = value(1);
        let mut graph = graph_with(vec![
            serial("both").writes(x).writes(y),
            serial("wx").writes(x),
            serial("ry").reads(y),
        ]);
        graph.insert_tasks(launches(&["both", "wx", "ry"]), false);

        assert!(graph.optimize_dead_store());
        assert_eq!(pending_names(&graph), vec!["both", "wx", "ry"]);

        let both = graph.node(graph.key_at(1));
        assert_eq!(both.meta().output_states, BTreeSet::from([y]));
        assert!(both.rec().unwrap().dead.contains(&x));
        assert_eq!(graph.verify(true), Ok(()));

        assert!(!graph.optimize_dead_store());
    }

    #[test]
    fn test_dead_store_never_removes_flow_sources() {
        let metas = vec![
            serial("a").writes(value(0)).writes(value(1)),
            serial("b").reads(value(0)).writes(value(2)),
            serial("c").reads(value(1)).reads(value(2)).writes(value(0)),
            serial("d").writes(value(1)),
            serial("e").reads(value(2)),
        ];
        let mut graph = graph_with(metas);
        graph.insert_tasks(
            launches(&["a", "b", "d", "c", "a", "e", "d", "b", "c", "d"]),
            false,
        );

        loop {
            let flowing: Vec<String> = graph
                .get_pending_tasks()
                .iter()
                .filter(|node| {
                    node.output_edges().iter().any(|(state, targets)| {
                        targets
                            .iter()
                            .any(|&t| node.has_state_flow(state, graph.node(t)))
                    })
                })
                .map(|node| node.to_string())
                .collect();

            let changed = graph.optimize_dead_store();
            let remaining: Vec<String> = graph
                .get_pending_tasks()
                .iter()
                .map(|node| node.to_string())
                .collect();

            for name in &flowing {
                assert!(remaining.contains(name), "{name} was removed");
            }
            assert_eq!(graph.verify(true), Ok(()));

            if !changed {
                break;
            }
        }
    }
}
