use fixedbitset::FixedBitSet;

use crate::core::TaskBank;
use crate::graph::StateFlowGraph;

/// Reachability over a window of pending nodes.
///
/// Row `i` of `descendants` has bit `j` set iff window node `j` is reachable
/// from window node `i`; `ancestors` is the transpose. Both are reflexive.
#[derive(Debug, Clone)]
pub struct Closure {
    descendants: Vec<FixedBitSet>,
    ancestors: Vec<FixedBitSet>,
}

impl Closure {
    /// Builds the closure of `len` nodes whose edges all point forward.
    /// `successors(i)` lists the window nodes with an edge from `i`.
    pub fn from_successors<F, I>(len: usize, mut successors: F) -> Self
    where
        F: FnMut(usize) -> I,
        I: IntoIterator<Item = usize>,
    {
        let mut descendants = vec![FixedBitSet::with_capacity(len); len];

        for i in (0..len).rev() {
            let mut row = FixedBitSet::with_capacity(len);
            row.insert(i);
            for succ in successors(i) {
                debug_assert!(succ > i, "edge {i} -> {succ} goes backwards");
                row.union_with(&descendants[succ]);
            }
            descendants[i] = row;
        }

        let mut ancestors = vec![FixedBitSet::with_capacity(len); len];
        for (i, row) in descendants.iter().enumerate() {
            for j in row.ones() {
                ancestors[j].insert(i);
            }
        }

        Self {
            descendants,
            ancestors,
        }
    }

    pub fn len(&self) -> usize {
        self.descendants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descendants.is_empty()
    }

    /// Whether `to` is reachable from `from`. Every node reaches itself.
    pub fn has_path(&self, from: usize, to: usize) -> bool {
        self.descendants[from].contains(to)
    }

    pub fn descendants(&self, node: usize) -> &FixedBitSet {
        &self.descendants[node]
    }

    pub fn ancestors(&self, node: usize) -> &FixedBitSet {
        &self.ancestors[node]
    }

    /// Contracts `a` and `b` into one vertex.
    ///
    /// Afterwards both rows describe the merged vertex: anything reaching
    /// either one reaches everything either one reached.
    pub fn merge(&mut self, a: usize, b: usize) {
        let mut reach = self.descendants[a].clone();
        reach.union_with(&self.descendants[b]);

        let mut reached_by = self.ancestors[a].clone();
        reached_by.union_with(&self.ancestors[b]);

        for x in reached_by.ones() {
            self.descendants[x].union_with(&reach);
        }
        for y in reach.ones() {
            self.ancestors[y].union_with(&reached_by);
        }
    }
}

impl<B: TaskBank> StateFlowGraph<B> {
    /// Reachability among pending nodes `begin..end`.
    ///
    /// Paths through nodes outside the window are not considered, which is
    /// exact as long as the pending order is topological.
    pub fn compute_transitive_closure(&self, begin: usize, end: usize) -> Closure {
        let keys = &self.pending_keys()[begin..end];

        Closure::from_successors(keys.len(), |i| {
            let mut succs: Vec<usize> = self.nodes[keys[i]]
                .output_edges
                .neighbors()
                .filter_map(|key| self.nodes[key].pending_node_id)
                .filter(|&pending| pending >= begin && pending < end)
                .map(|pending| pending - begin)
                .collect();
            succs.sort_unstable();
            succs.dedup();
            succs
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::*;

    fn diamond() -> Closure {
        // 0 -> 1 -> 3, 0 -> 2 -> 3, 4 isolated
        let edges: Vec<Vec<usize>> = vec![vec![1, 2], vec![3], vec![3], vec![], vec![]];
        Closure::from_successors(edges.len(), |i| edges[i].clone())
    }

    #[test]
    fn test_diamond_reachability() {
        let closure = diamond();

        assert!(closure.has_path(0, 3));
        assert!(closure.has_path(1, 3));
        assert!(closure.has_path(2, 2));
        assert!(!closure.has_path(1, 2));
        assert!(!closure.has_path(3, 0));
        assert!(!closure.has_path(0, 4));
        assert_eq!(closure.ancestors(3).ones().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_descendants_mirror_ancestors() {
        let closure = diamond();

        for a in 0..closure.len() {
            for b in 0..closure.len() {
                assert_eq!(
                    closure.descendants(a).contains(b),
                    closure.ancestors(b).contains(a),
                    "pair ({a}, {b})"
                );
            }
        }
    }

    #[test]
    fn test_merge_contracts() {
        let mut closure = diamond();
        closure.merge(1, 4);

        assert!(closure.has_path(0, 4));
        assert!(closure.has_path(4, 3));
        assert!(closure.has_path(1, 4));
        assert!(closure.has_path(4, 1));
        assert!(!closure.has_path(2, 4));

        for a in 0..closure.len() {
            for b in 0..closure.len() {
                assert_eq!(closure.has_path(a, b), closure.ancestors(b).contains(a));
            }
        }
    }

    #[test]
    fn test_graph_closure_window() {
        let x = value(0);
        let y = value(1);
        let mut graph = graph_with(vec![
            serial("wx").writes(x),
            serial("rx").reads(x).writes(y),
            serial("ry").reads(y),
            serial("other").writes(value(2)),
        ]);
        graph.insert_tasks(launches(&["wx", "rx", "ry", "other"]), false);

        let closure = graph.compute_transitive_closure(0, 4);
        assert!(closure.has_path(0, 2));
        assert!(!closure.has_path(0, 3));
        assert!(!closure.has_path(2, 0));

        let tail = graph.compute_transitive_closure(1, 3);
        assert_eq!(tail.len(), 2);
        assert!(tail.has_path(0, 1));
    }
}
