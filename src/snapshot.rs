// src/snapshot.rs

//! Durable opaque job state, handed to a job on every run.
//!
//! A job may return a new state when it succeeds or store one explicitly
//! through a request while it runs. The engine never looks inside it.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{JobvisorError, Result};
use crate::types::JobId;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Last stored state of the job, `None` if nothing was stored yet.
    async fn load(&self, job: JobId) -> Result<Option<Value>>;
    /// Replace the stored state of the job.
    async fn store(&self, job: JobId, state: Value) -> Result<()>;
    async fn delete(&self, job: JobId) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    states: Mutex<HashMap<JobId, Value>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, job: JobId) -> Result<Option<Value>> {
        let state = self.states.lock().get(&job).cloned();
        if state.is_none() {
            info!(job_id = job, "state for job not found");
        }
        Ok(state)
    }

    async fn store(&self, job: JobId, state: Value) -> Result<()> {
        self.states.lock().insert(job, state);
        Ok(())
    }

    async fn delete(&self, job: JobId) -> Result<()> {
        self.states.lock().remove(&job);
        Ok(())
    }
}

/// One `<job id>.json` file per job inside a directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, job: JobId) -> PathBuf {
        self.dir.join(format!("{job}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, job: JobId) -> Result<Option<Value>> {
        let path = self.path_for(job);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state = serde_json::from_slice(&bytes).map_err(|err| {
                    JobvisorError::Snapshot(format!("corrupt state of job {job}: {err}"))
                })?;
                Ok(Some(state))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(job_id = job, "state for job not found");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn store(&self, job: JobId, state: Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(job);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&state)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(job_id = job, path = %path.display(), "stored job state");
        Ok(())
    }

    async fn delete(&self, job: JobId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(job)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
