// src/engine/queue.rs

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use crate::engine::entities::Entities;
use crate::types::{JobId, RunId, TaskId, TaskType};

/// Which handler operation a build entry invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    Build,
    /// First build of a task; also provisions its environment. A failed
    /// init leaves the task uninitialized instead of failed.
    Init,
}

impl fmt::Display for BuildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildKind::Build => f.write_str("build"),
            BuildKind::Init => f.write_str("init"),
        }
    }
}

/// A run that passed admission and only waits for the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRun {
    pub job_id: JobId,
    pub run_id: RunId,
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub params: Value,
    pub entities: Entities,
    pub task_dir: PathBuf,
}

/// Entry of the work queue drained by the dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkEntry {
    Build {
        kind: BuildKind,
        task_id: TaskId,
        code: String,
        dest_dir: PathBuf,
    },
    Run(PreparedRun),
    DeleteTask {
        task_id: TaskId,
        task_type: TaskType,
    },
    DeleteJob {
        job_id: JobId,
    },
}

/// FIFO of work entries.
///
/// Entries are processed strictly in arrival order. The only out-of-order
/// operation is [`WorkQueue::remove_run`], used when a queued run is stopped
/// before it is dispatched.
#[derive(Debug, Default)]
pub struct WorkQueue {
    entries: VecDeque<WorkEntry>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: WorkEntry) {
        self.entries.push_back(entry);
        debug!(len = self.entries.len(), "work entry queued");
    }

    pub fn pop(&mut self) -> Option<WorkEntry> {
        self.entries.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains_run(&self, run_id: RunId) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, WorkEntry::Run(run) if run.run_id == run_id))
    }

    /// Take a queued run out of the queue.
    pub fn remove_run(&mut self, run_id: RunId) -> Option<PreparedRun> {
        let idx = self
            .entries
            .iter()
            .position(|e| matches!(e, WorkEntry::Run(run) if run.run_id == run_id))?;
        match self.entries.remove(idx) {
            Some(WorkEntry::Run(run)) => Some(run),
            _ => None,
        }
    }
}
