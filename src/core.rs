use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifier of a node in the spatial data structure tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SNodeId(pub u32);

/// Identifier of a compiled kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelId(pub u32);

/// The underlying resource a piece of async state lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resource {
    /// A field of the spatial data structure.
    SNode(SNodeId),
    /// The global temporary buffer owned by a single kernel.
    GlobalTmp(KernelId),
}

impl Display for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::SNode(SNodeId(id)) => write!(f, "S{id}"),
            Resource::GlobalTmp(KernelId(id)) => write!(f, "tmp{id}"),
        }
    }
}

/// Which aspect of a resource is read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateKind {
    /// The stored values.
    Value,
    /// The activation mask.
    Mask,
    /// The generated index list used by struct-for loops.
    List,
    /// The memory allocator backing dynamic structures.
    Allocator,
}

impl StateKind {
    fn as_str(self) -> &'static str {
        match self {
            StateKind::Value => "value",
            StateKind::Mask => "mask",
            StateKind::List => "list",
            StateKind::Allocator => "allocator",
        }
    }
}

/// One unit of mutable state a task may read or write.
///
/// Equality is by identity of the underlying resource and the kind of access,
/// so `S1_value` and `S1_mask` are unrelated states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AsyncState {
    pub resource: Resource,
    pub kind: StateKind,
}

impl AsyncState {
    pub fn new(resource: Resource, kind: StateKind) -> Self {
        Self { resource, kind }
    }

    pub fn value(snode: SNodeId) -> Self {
        Self::new(Resource::SNode(snode), StateKind::Value)
    }

    pub fn mask(snode: SNodeId) -> Self {
        Self::new(Resource::SNode(snode), StateKind::Mask)
    }

    pub fn list(snode: SNodeId) -> Self {
        Self::new(Resource::SNode(snode), StateKind::List)
    }

    pub fn allocator(snode: SNodeId) -> Self {
        Self::new(Resource::SNode(snode), StateKind::Allocator)
    }

    pub fn global_tmp(kernel: KernelId) -> Self {
        Self::new(Resource::GlobalTmp(kernel), StateKind::Value)
    }

    /// The structure node this state belongs to, if any.
    pub fn snode(&self) -> Option<SNodeId> {
        match self.resource {
            Resource::SNode(snode) => Some(snode),
            Resource::GlobalTmp(_) => None,
        }
    }

    /// Human readable name, also used as a DOT port identifier.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl Display for AsyncState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.resource, self.kind.as_str())
    }
}

/// Shape of an offloaded task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    Serial,
    RangeFor,
    StructFor,
    Listgen,
    Gc,
}

impl TaskType {
    /// Whether iterations of this task may run concurrently with each other.
    pub fn is_parallel(self) -> bool {
        matches!(self, TaskType::RangeFor | TaskType::StructFor)
    }
}

/// Launch parameters that must agree for two tasks to be fused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FusionMeta {
    /// Only set for tasks touching per-kernel global temporaries, which
    /// cannot be fused with tasks of another kernel.
    pub kernel: Option<KernelId>,
    pub task_type: TaskType,
    pub snode: Option<SNodeId>,
    pub block_dim: u32,
    pub bit_vectorized: bool,
}

impl FusionMeta {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            kernel: None,
            task_type,
            snode: None,
            block_dim: 0,
            bit_vectorized: false,
        }
    }
}

/// Static description of the states a task type reads and writes.
///
/// Metas are shared through [`Arc`] by every launch of the same task type;
/// two nodes launch the same task iff their metas are the same allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMeta {
    pub name: String,
    pub task_type: TaskType,
    /// Loop target of struct-for and listgen tasks.
    pub snode: Option<SNodeId>,
    pub input_states: BTreeSet<AsyncState>,
    pub output_states: BTreeSet<AsyncState>,
    /// Structures accessed only at the task's own loop index.
    pub element_wise: BTreeSet<SNodeId>,
    /// `None` for tasks that must never be fused.
    pub fusion: Option<FusionMeta>,
    /// Prints, assertions and other effects the graph cannot see.
    pub has_side_effects: bool,
}

impl TaskMeta {
    pub fn new(name: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            name: name.into(),
            task_type,
            snode: None,
            input_states: BTreeSet::new(),
            output_states: BTreeSet::new(),
            element_wise: BTreeSet::new(),
            fusion: None,
            has_side_effects: false,
        }
    }

    pub fn reads(mut self, state: AsyncState) -> Self {
        self.input_states.insert(state);
        self
    }

    pub fn writes(mut self, state: AsyncState) -> Self {
        self.output_states.insert(state);
        self
    }

    pub fn on_snode(mut self, snode: SNodeId) -> Self {
        self.snode = Some(snode);
        self
    }

    pub fn element_wise(mut self, snode: SNodeId) -> Self {
        self.element_wise.insert(snode);
        self
    }

    pub fn fusible(mut self, fusion: FusionMeta) -> Self {
        self.fusion = Some(fusion);
        self
    }

    pub fn with_side_effects(mut self) -> Self {
        self.has_side_effects = true;
        self
    }

    pub fn into_shared(self) -> Arc<TaskMeta> {
        Arc::new(self)
    }

    /// Both tasks carry a fusion key and the keys agree.
    pub fn fusion_compatible(&self, other: &TaskMeta) -> bool {
        match (&self.fusion, &other.fusion) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// States through which `self` followed by `later` forms a hazard
    /// (read-after-write, write-after-read or write-after-write).
    pub fn conflicts_with<'a>(&'a self, later: &'a TaskMeta) -> impl Iterator<Item = AsyncState> + 'a {
        let raw = self.output_states.intersection(&later.input_states);
        let waw = self.output_states.intersection(&later.output_states);
        let war = self.input_states.intersection(&later.output_states);

        raw.chain(waw).chain(war).copied()
    }
}

/// The external IR collaborator.
///
/// The graph never looks inside a launch record. Everything it needs to know
/// about a record, and every rewrite of a record's body, goes through this
/// trait.
pub trait TaskBank: Sync {
    /// Opaque launch payload, forwarded unchanged to the executor.
    type Record: Clone + Debug + Send + Sync;

    /// Returns the meta of the task a record launches. Launches of the same
    /// task type should return the same [`Arc`].
    fn meta(&self, record: &Self::Record) -> Arc<TaskMeta>;

    /// Produces a single record that runs `first` and then `second`.
    fn fuse(&self, _first: &Self::Record, _second: &Self::Record) -> Option<Self::Record> {
        None
    }

    /// Rewrites `record` with its activations removed, given that
    /// `dominated_by` already activated the same elements.
    fn demote_activation(
        &self,
        _record: &Self::Record,
        _dominated_by: &Self::Record,
    ) -> Option<Self::Record> {
        None
    }

    /// Rewrites `record` without its stores to `dead`.
    fn eliminate_stores(
        &self,
        _record: &Self::Record,
        _dead: &BTreeSet<AsyncState>,
    ) -> Option<Self::Record> {
        None
    }

    /// Re-derives the meta straight from the record's instructions, bypassing
    /// any cache. Used by `verify` to cross-check recorded state usage.
    fn analyze(&self, _record: &Self::Record) -> Option<TaskMeta> {
        None
    }

    /// Direct children of a structure node.
    fn snode_children(&self, _snode: SNodeId) -> Vec<SNodeId> {
        Vec::new()
    }
}
