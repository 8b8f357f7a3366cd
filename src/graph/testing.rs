//! In-crate mock of the IR collaborator, shared by the graph and engine tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::core::{AsyncState, FusionMeta, SNodeId, TaskBank, TaskMeta, TaskType};
use crate::graph::StateFlowGraph;

/// A launch of one registered task, or of several fused ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Launch {
    pub(crate) parts: Vec<String>,
    pub(crate) demoted: bool,
    pub(crate) dead: BTreeSet<AsyncState>,
}

impl Launch {
    pub(crate) fn name(&self) -> String {
        self.parts.join("+")
    }

    fn is_plain(&self) -> bool {
        self.parts.len() == 1 && !self.demoted && self.dead.is_empty()
    }

    fn cache_key(&self) -> String {
        let mut key = self.name();
        if self.demoted {
            key.push_str("#demoted");
        }
        for state in &self.dead {
            key.push_str(&format!("#-{state}"));
        }
        key
    }
}

#[derive(Default)]
pub(crate) struct MockBank {
    metas: HashMap<String, Arc<TaskMeta>>,
    derived: Mutex<HashMap<String, Arc<TaskMeta>>>,
    children: HashMap<SNodeId, Vec<SNodeId>>,
    pub(crate) refuse_fusion: bool,
    /// Meta returned by `analyze` for launches with this name.
    pub(crate) corrupt: Option<(String, TaskMeta)>,
}

impl MockBank {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, meta: TaskMeta) {
        self.metas.insert(meta.name.clone(), meta.into_shared());
    }

    pub(crate) fn add_child(&mut self, parent: SNodeId, child: SNodeId) {
        self.children.entry(parent).or_default().push(child);
    }

    fn base(&self, name: &str) -> &Arc<TaskMeta> {
        self.metas
            .get(name)
            .unwrap_or_else(|| panic!("unregistered task {name}"))
    }

    fn derive(&self, launch: &Launch) -> TaskMeta {
        let first = self.base(&launch.parts[0]);
        let mut meta = TaskMeta {
            name: launch.name(),
            ..(**first).clone()
        };

        for part in &launch.parts[1..] {
            let other = self.base(part);
            meta.input_states.extend(other.input_states.iter().copied());
            meta.output_states.extend(other.output_states.iter().copied());
            meta.element_wise.extend(other.element_wise.iter().copied());
            meta.has_side_effects |= other.has_side_effects;
        }

        if launch.demoted {
            meta.output_states.retain(|state| {
                !matches!(
                    state.kind,
                    crate::core::StateKind::Mask | crate::core::StateKind::Allocator
                )
            });
        }
        meta.output_states.retain(|state| !launch.dead.contains(state));
        meta
    }
}

impl TaskBank for MockBank {
    type Record = Launch;

    fn meta(&self, record: &Launch) -> Arc<TaskMeta> {
        if record.is_plain() {
            return self.base(&record.parts[0]).clone();
        }

        let mut derived = self.derived.lock().unwrap();
        derived
            .entry(record.cache_key())
            .or_insert_with(|| self.derive(record).into_shared())
            .clone()
    }

    fn fuse(&self, first: &Launch, second: &Launch) -> Option<Launch> {
        let plain = |l: &Launch| !l.demoted && l.dead.is_empty();
        if self.refuse_fusion || !plain(first) || !plain(second) {
            return None;
        }

        let mut parts = first.parts.clone();
        parts.extend(second.parts.iter().cloned());
        Some(Launch {
            parts,
            demoted: false,
            dead: BTreeSet::new(),
        })
    }

    fn demote_activation(&self, record: &Launch, _dominated_by: &Launch) -> Option<Launch> {
        Some(Launch {
            demoted: true,
            ..record.clone()
        })
    }

    fn eliminate_stores(&self, record: &Launch, dead: &BTreeSet<AsyncState>) -> Option<Launch> {
        let mut record = record.clone();
        record.dead.extend(dead.iter().copied());
        Some(record)
    }

    fn analyze(&self, record: &Launch) -> Option<TaskMeta> {
        if let Some((name, meta)) = &self.corrupt {
            if *name == record.name() {
                return Some(meta.clone());
            }
        }
        Some((*self.meta(record)).clone())
    }

    fn snode_children(&self, snode: SNodeId) -> Vec<SNodeId> {
        self.children.get(&snode).cloned().unwrap_or_default()
    }
}

pub(crate) fn value(id: u32) -> AsyncState {
    AsyncState::value(SNodeId(id))
}

pub(crate) fn mask(snode: SNodeId) -> AsyncState {
    AsyncState::mask(snode)
}

pub(crate) fn list(snode: SNodeId) -> AsyncState {
    AsyncState::list(snode)
}

/// A fusible serial task.
pub(crate) fn serial(name: &str) -> TaskMeta {
    TaskMeta::new(name, TaskType::Serial).fusible(FusionMeta::new(TaskType::Serial))
}

/// A fusible range-for task with the default launch shape.
pub(crate) fn range_for(name: &str) -> TaskMeta {
    TaskMeta::new(name, TaskType::RangeFor).fusible(FusionMeta {
        block_dim: 128,
        ..FusionMeta::new(TaskType::RangeFor)
    })
}

/// A fusible struct-for task over the list of `snode`.
pub(crate) fn struct_for(name: &str, snode: SNodeId) -> TaskMeta {
    TaskMeta::new(name, TaskType::StructFor)
        .on_snode(snode)
        .reads(list(snode))
        .fusible(FusionMeta {
            snode: Some(snode),
            block_dim: 128,
            ..FusionMeta::new(TaskType::StructFor)
        })
}

/// Generates the list of `snode` from the list of its parent.
pub(crate) fn listgen(name: &str, snode: SNodeId, parent: SNodeId) -> TaskMeta {
    TaskMeta::new(name, TaskType::Listgen)
        .on_snode(snode)
        .reads(list(parent))
        .reads(mask(snode))
        .writes(list(snode))
}

pub(crate) fn graph_with(metas: Vec<TaskMeta>) -> StateFlowGraph<MockBank> {
    let mut bank = MockBank::new();
    for meta in metas {
        bank.register(meta);
    }
    StateFlowGraph::new(bank)
}

pub(crate) fn launch(name: &str) -> Launch {
    Launch {
        parts: vec![name.to_string()],
        demoted: false,
        dead: BTreeSet::new(),
    }
}

pub(crate) fn launches(names: &[&str]) -> Vec<Launch> {
    names.iter().map(|name| launch(name)).collect()
}

pub(crate) fn names(records: &[Launch]) -> Vec<String> {
    records.iter().map(Launch::name).collect()
}

pub(crate) fn pending_names(graph: &StateFlowGraph<MockBank>) -> Vec<String> {
    graph
        .get_pending_tasks()
        .iter()
        .map(|node| node.meta().name.clone())
        .collect()
}

/// Every `(from, to, state)` edge of the graph, by node display name.
pub(crate) fn edge_list(graph: &StateFlowGraph<MockBank>) -> Vec<(String, String, AsyncState)> {
    let mut edges = Vec::new();
    for &key in graph.node_keys() {
        let node = graph.node(key);
        for (state, targets) in node.output_edges().iter() {
            for &target in targets {
                edges.push((node.to_string(), graph.node(target).to_string(), state));
            }
        }
    }
    edges.sort();
    edges
}
