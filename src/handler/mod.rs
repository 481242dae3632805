// src/handler/mod.rs

//! Pluggable per-task-type executors.
//!
//! The engine talks to a [`TypeHandler`] instead of spawning processes itself.
//! This makes it easy to swap in a fake handler in tests while keeping the
//! production implementation in [`python`].
//!
//! `build`, `init` and `run` return owned futures: the engine spawns them and
//! learns about completion through its own event channel, so a long build or
//! run never blocks the dispatch loop.

pub mod python;
pub mod registry;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use serde_json::Value;

use crate::engine::entities::Entities;
use crate::engine::requests::RequestHandle;
use crate::errors::Result;
use crate::types::{BuildOutput, JobId, RunId, TaskId};

pub use registry::HandlerRegistry;

/// Boxed future returned by handler operations.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a `build` or `init` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Success {
        warnings: Vec<String>,
    },
    Failure {
        warnings: Vec<String>,
        errors: Vec<String>,
    },
}

impl BuildOutcome {
    pub fn success() -> Self {
        BuildOutcome::Success {
            warnings: Vec::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        BuildOutcome::Failure {
            warnings: Vec::new(),
            errors: vec![error.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Success { .. })
    }

    /// Structured output persisted on the task.
    pub fn to_output(&self) -> BuildOutput {
        match self {
            BuildOutcome::Success { warnings } => BuildOutput::new(warnings.clone(), Vec::new()),
            BuildOutcome::Failure { warnings, errors } => {
                BuildOutput::new(warnings.clone(), errors.clone())
            }
        }
    }
}

/// Result of a `run` call.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The job finished; `new_state` replaces the stored job state when set.
    Success {
        output: String,
        new_state: Option<Value>,
    },
    Failure(String),
}

/// Everything a handler gets to execute one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub job_id: JobId,
    pub run_id: RunId,
    pub params: Value,
    pub entities: Entities,
    /// State stored by the previous runs of the job, if any.
    pub previous_state: Option<Value>,
    pub work_dir: PathBuf,
    /// Channel back to the engine for structured requests made by the job.
    pub requests: RequestHandle,
}

/// Trait implemented by every task type.
///
/// Production code uses [`python::PythonHandler`]; tests can provide their
/// own implementation that doesn't spawn real processes.
pub trait TypeHandler: Send + Sync {
    /// Turn `code` into a runnable artifact inside `dest_dir`.
    fn build(
        &self,
        task: TaskId,
        code: String,
        dest_dir: PathBuf,
    ) -> HandlerFuture<'static, BuildOutcome>;

    /// One-time setup of the task environment followed by a build.
    fn init(
        &self,
        task: TaskId,
        code: String,
        dest_dir: PathBuf,
    ) -> HandlerFuture<'static, BuildOutcome>;

    /// Execute one run. The future resolves once the run is over, whether it
    /// finished on its own or was stopped.
    fn run(&self, ctx: RunContext) -> HandlerFuture<'static, RunOutcome>;

    /// Ask a running run to stop. Unknown or finished runs are ignored.
    fn stop(&self, run: RunId) -> HandlerFuture<'_, Result<()>>;

    /// Release whatever the handler keeps for a deleted task.
    fn remove(&self, task: TaskId) -> HandlerFuture<'_, Result<()>>;
}
