// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::types::{JobId, RunId, TaskId};

#[derive(Error, Debug)]
pub enum JobvisorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Snapshot store error: {0}")]
    Snapshot(String),

    #[error("Job {0} not found.")]
    JobNotFound(JobId),

    #[error("Task {0} not found.")]
    TaskNotFound(TaskId),

    #[error("Run {0} not found.")]
    RunNotFound(RunId),

    #[error("Task {task} had parameters changed, please update {job} job's parameters first.")]
    InvalidParams { task: String, job: String },

    #[error("Handler for type not found: {0}")]
    HandlerNotFound(String),

    #[error("Job {0} already running")]
    AlreadyRunning(String),

    #[error("Task {0} is being build and job is already queued to run after build.")]
    AlreadyWaitingForBuild(String),

    #[error("Task {0} is not build.")]
    TaskNotBuilt(String),

    #[error("{0}")]
    EntityResolution(String),

    #[error("Task {0} still has dependent jobs")]
    DependentJobs(TaskId),

    #[error("worker channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, JobvisorError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for JobvisorError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        JobvisorError::ChannelClosed
    }
}
