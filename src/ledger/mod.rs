// src/ledger/mod.rs

//! Durable records of tasks, jobs and runs.
//!
//! The engine only talks to the relational store through the [`Ledger`] and
//! [`SignalCatalog`] traits. [`MemoryLedger`] implements both, optionally
//! mirroring its state to a JSON file so that it survives restarts.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::types::{
    BuildOutput, BuildState, Job, JobId, JobRun, JobState, RunId, RunStatus, RunUpdate, Signal,
    SignalSet, SignalSetId, Task, TaskId, TaskSettings, TaskType,
};

pub use memory::MemoryLedger;

/// Row data for a task that does not have an id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub name: String,
    pub task_type: TaskType,
    pub settings: TaskSettings,
    pub build_state: BuildState,
    pub initialized: bool,
}

/// Row data for a job that does not have an id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub task: TaskId,
    pub params: Value,
    pub state: JobState,
    pub trigger: Option<u64>,
    pub min_gap: Option<u64>,
    pub delay: Option<u64>,
    pub signal_set_triggers: Vec<SignalSetId>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn insert_task(&self, task: NewTask) -> Result<TaskId>;
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;
    /// Replace name and settings of an existing task.
    async fn update_task(&self, id: TaskId, name: String, settings: TaskSettings) -> Result<()>;
    async fn delete_task(&self, id: TaskId) -> Result<()>;
    /// Set the build state; the stored output is only replaced when given.
    /// Reaching `Finished` marks the task initialized, `Uninitialized` clears it.
    async fn set_build_state(
        &self,
        id: TaskId,
        state: BuildState,
        output: Option<BuildOutput>,
    ) -> Result<()>;
    async fn tasks_in_build_states(&self, states: &[BuildState]) -> Result<Vec<Task>>;

    async fn insert_job(&self, job: NewJob) -> Result<JobId>;
    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;
    async fn jobs_by_state(&self, state: JobState) -> Result<Vec<Job>>;
    async fn jobs_of_task(&self, task: TaskId) -> Result<Vec<Job>>;
    async fn jobs_triggered_by(&self, set: SignalSetId) -> Result<Vec<Job>>;
    async fn set_job_state(&self, id: JobId, state: JobState) -> Result<()>;
    async fn delete_job(&self, id: JobId) -> Result<()>;

    async fn create_run(
        &self,
        job: JobId,
        status: RunStatus,
        started_at: DateTime<Utc>,
    ) -> Result<RunId>;
    async fn get_run(&self, id: RunId) -> Result<Option<JobRun>>;
    async fn update_run(&self, id: RunId, update: RunUpdate) -> Result<()>;
    /// Most recent successful run of the job, ordered by `started_at`.
    async fn last_successful_run(&self, job: JobId) -> Result<Option<JobRun>>;
    async fn runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<JobRun>>;
    async fn delete_run(&self, id: RunId) -> Result<()>;
    /// Delete terminal runs that finished before `cutoff`; returns how many.
    async fn delete_finished_runs_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Signal to create inside a computed signal set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSignal {
    pub cid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Computed signal set requested by a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSignalSet {
    pub cid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: u64,
    #[serde(default)]
    pub signals: Vec<NewSignal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedSignalSet {
    pub set: SignalSet,
    pub signals: Vec<Signal>,
}

/// Lookup and creation of signal sets, the data sources jobs work on.
#[async_trait]
pub trait SignalCatalog: Send + Sync {
    async fn signal_set_by_cid(&self, cid: &str) -> Result<Option<SignalSet>>;
    async fn signal_in_set(&self, set: SignalSetId, cid: &str) -> Result<Option<Signal>>;
    /// Create a computed set with its signals, owned by `owner`. All or nothing.
    async fn create_signal_set(&self, owner: JobId, set: NewSignalSet)
    -> Result<CreatedSignalSet>;
    /// Delete the computed sets created on behalf of `owner`; returns their ids.
    async fn delete_sets_owned_by(&self, owner: JobId) -> Result<Vec<SignalSetId>>;
}
