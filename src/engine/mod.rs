mod runner;

use std::sync::mpsc::Sender;

use crate::error::SchedulerError;

pub use crate::engine::runner::{FlushReport, Scheduler};

/// The backend that runs extracted tasks.
pub trait Executor {
    type Record;

    /// Runs a batch of launch records in the given order.
    fn execute(&mut self, tasks: Vec<Self::Record>) -> anyhow::Result<()>;
}

/// Handle for enqueuing launches from any thread.
///
/// Launches are buffered until the owning [`Scheduler`] flushes; the graph
/// itself is only ever touched by the scheduler's thread.
pub struct Submitter<R> {
    sender: Sender<R>,
}

impl<R> Clone for Submitter<R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<R> Submitter<R> {
    pub(crate) fn new(sender: Sender<R>) -> Self {
        Self { sender }
    }

    /// Fails once the scheduler has been dropped.
    pub fn submit(&self, record: R) -> Result<(), SchedulerError> {
        self.sender
            .send(record)
            .map_err(|_| SchedulerError::Disconnected)
    }
}
