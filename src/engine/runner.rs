use std::fs;
use std::sync::mpsc::{Receiver, Sender, channel};

use tracing::Level;

use crate::config::SchedulerConfig;
use crate::core::TaskBank;
use crate::engine::{Executor, Submitter};
use crate::error::SchedulerError;
use crate::graph::StateFlowGraph;

/// Outcome of one [`Scheduler::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    /// Launches taken from the queue.
    pub submitted: usize,
    /// Launches that made it into the graph after listgen filtering.
    pub inserted: usize,
    /// Tasks handed to the executor after optimization.
    pub executed: usize,
    /// Rounds of the optimization loop.
    pub iterations: usize,
}

/// Drives a [`StateFlowGraph`]: buffers launches, optimizes them in batches
/// and hands the result to an [`Executor`].
pub struct Scheduler<B, E>
where
    B: TaskBank,
    E: Executor<Record = B::Record>,
{
    graph: StateFlowGraph<B>,
    executor: E,
    config: SchedulerConfig,
    sender: Sender<B::Record>,
    receiver: Receiver<B::Record>,
    since_flush: usize,
    flushes: usize,
}

impl<B, E> Scheduler<B, E>
where
    B: TaskBank,
    E: Executor<Record = B::Record>,
{
    pub fn new(bank: B, executor: E, config: SchedulerConfig) -> Self {
        let mut graph = StateFlowGraph::new(bank);
        graph.set_fusion_window(config.fusion_window);

        let (sender, receiver) = channel();

        Self {
            graph,
            executor,
            config,
            sender,
            receiver,
            since_flush: 0,
            flushes: 0,
        }
    }

    pub fn submitter(&self) -> Submitter<B::Record> {
        Submitter::new(self.sender.clone())
    }

    pub fn graph(&self) -> &StateFlowGraph<B> {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut StateFlowGraph<B> {
        &mut self.graph
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Enqueues a launch, flushing when `flush_every` launches have
    /// accumulated.
    pub fn launch(&mut self, record: B::Record) -> Result<Option<FlushReport>, SchedulerError> {
        self.sender
            .send(record)
            .map_err(|_| SchedulerError::Disconnected)?;
        self.since_flush += 1;

        match self.config.flush_every {
            Some(every) if self.since_flush >= every => self.flush().map(Some),
            _ => Ok(None),
        }
    }

    /// Inserts every queued launch, optimizes, and executes the result.
    pub fn flush(&mut self) -> Result<FlushReport, SchedulerError> {
        let span = tracing::span!(Level::INFO, "flush", index = self.flushes);
        let _enter = span.enter();

        let records: Vec<B::Record> = self.receiver.try_iter().collect();
        let submitted = records.len();
        let inserted = self.graph.insert_tasks(records, self.config.listgen_filter);

        let iterations = self.optimize()?;

        let tasks = self.graph.extract_to_execute();
        let executed = tasks.len();
        if !tasks.is_empty() {
            self.executor
                .execute(tasks)
                .map_err(SchedulerError::Execute)?;
        }

        self.flushes += 1;
        self.since_flush = 0;

        tracing::info!(
            "Flushed {} launches: {} inserted, {} executed after {} rounds",
            submitted,
            inserted,
            executed,
            iterations
        );

        Ok(FlushReport {
            submitted,
            inserted,
            executed,
            iterations,
        })
    }

    /// Runs the enabled passes until none of them changes the graph, or the
    /// iteration limit is hit. Returns the number of rounds.
    pub fn optimize(&mut self) -> Result<usize, SchedulerError> {
        if self.graph.num_pending_tasks() == 0 {
            return Ok(0);
        }

        let mut iterations = 0;
        while iterations < self.config.max_optimize_iterations {
            iterations += 1;
            let mut modified = false;

            if self.config.listgen {
                modified |= self.graph.optimize_listgen();
                self.check("listgen");
            }
            if self.config.dead_store {
                modified |= self.graph.optimize_dead_store();
                self.check("dead store elimination");
            }
            if self.config.activation_demotion {
                modified |= self.graph.demote_activation();
                self.check("activation demotion");
            }
            if self.config.fusion {
                modified |= self.graph.fuse();
                self.check("fusion");
            }

            self.dump_dot(iterations)?;

            tracing::debug!(
                "Optimization round {}: {} pending tasks",
                iterations,
                self.graph.num_pending_tasks()
            );

            if !modified {
                break;
            }
        }

        Ok(iterations)
    }

    fn check(&self, pass: &str) {
        if !self.config.debug_verify {
            return;
        }
        if let Err(error) = self.graph.verify(false) {
            self.graph.print();
            panic!("State flow graph broken after {pass}:\n{error}");
        }
    }

    fn dump_dot(&self, iteration: usize) -> Result<(), SchedulerError> {
        let Some(dir) = &self.config.dot_dump_dir else {
            return Ok(());
        };

        fs::create_dir_all(dir)?;
        let path = dir.join(format!("sfg_{:04}_{:02}.dot", self.flushes, iteration));
        fs::write(&path, self.graph.dump_dot(Some("LR"), 2))?;

        tracing::debug!("Wrote {}", path);
        Ok(())
    }
}
