#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod core;
mod engine;
mod error;
pub mod graph;
#[cfg(feature = "logging")]
pub mod logging;

pub use crate::config::SchedulerConfig;
pub use crate::core::{
    AsyncState, FusionMeta, KernelId, Resource, SNodeId, StateKind, TaskBank, TaskMeta, TaskType,
};
pub use crate::engine::{Executor, FlushReport, Scheduler, Submitter};
pub use crate::error::*;
pub use crate::graph::{Node, NodeKey, StateFlowGraph};
