// src/front.rs

//! Front-process operations.
//!
//! The front owns ledger writes for user actions (task edits, manual runs,
//! deletions) and forwards everything that needs the dispatch loop as a
//! [`HandlerMsg`]. It never touches the worker's in-memory state.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::engine::{HandlerMsg, WorkerHandle};
use crate::errors::{JobvisorError, Result};
use crate::ledger::{Ledger, NewTask, SignalCatalog};
use crate::paths::{task_build_output_dir, task_dir};
use crate::types::{BuildState, JobId, JobState, RunId, RunStatus, Task, TaskId, TaskSettings, TaskType};

#[derive(Clone)]
pub struct Control {
    ledger: Arc<dyn Ledger>,
    catalog: Arc<dyn SignalCatalog>,
    worker: WorkerHandle,
    clock: Arc<dyn Clock>,
    content_dir: PathBuf,
}

impl Control {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        catalog: Arc<dyn SignalCatalog>,
        worker: WorkerHandle,
        clock: Arc<dyn Clock>,
        content_dir: PathBuf,
    ) -> Self {
        Self {
            ledger,
            catalog,
            worker,
            clock,
            content_dir,
        }
    }

    /// Insert a task and request its first (initializing) build.
    pub async fn create_task(
        &self,
        name: impl Into<String>,
        task_type: TaskType,
        settings: TaskSettings,
    ) -> Result<TaskId> {
        let code = settings.code.clone();
        let task_id = self
            .ledger
            .insert_task(NewTask {
                name: name.into(),
                task_type,
                settings,
                build_state: BuildState::Scheduled,
                initialized: false,
            })
            .await?;

        info!(task_id, %task_type, "task created");
        self.worker
            .send(HandlerMsg::Init {
                task_id,
                code,
                dest_dir: task_build_output_dir(&self.content_dir, task_id),
            })
            .await?;
        Ok(task_id)
    }

    /// Store an edit and rebuild the task.
    ///
    /// Jobs of the task are marked `invalid-params` when the parameter
    /// schema changed, since their parameter bags were written against the
    /// old one.
    pub async fn update_task(
        &self,
        task_id: TaskId,
        name: impl Into<String>,
        settings: TaskSettings,
    ) -> Result<()> {
        let task = self.require_task(task_id).await?;

        if task.settings.params != settings.params {
            for job in self.ledger.jobs_of_task(task_id).await? {
                info!(job_id = job.id, task_id, "task params changed; invalidating job");
                self.ledger
                    .set_job_state(job.id, JobState::InvalidParams)
                    .await?;
            }
        }

        self.ledger
            .update_task(task_id, name.into(), settings.clone())
            .await?;
        self.schedule_build(&task, settings.code).await
    }

    /// Rebuild a task with its current code.
    pub async fn compile(&self, task_id: TaskId) -> Result<()> {
        let task = self.require_task(task_id).await?;
        let code = task.settings.code.clone();
        self.schedule_build(&task, code).await
    }

    /// Rebuild every task.
    pub async fn compile_all(&self) -> Result<usize> {
        let tasks = self.ledger.list_tasks().await?;
        let count = tasks.len();
        for task in tasks {
            let code = task.settings.code.clone();
            self.schedule_build(&task, code).await?;
        }
        info!(count, "scheduled rebuild of all tasks");
        Ok(count)
    }

    async fn schedule_build(&self, task: &Task, code: String) -> Result<()> {
        self.ledger
            .set_build_state(task.id, BuildState::Scheduled, None)
            .await?;

        let dest_dir = task_build_output_dir(&self.content_dir, task.id);
        let msg = if !task.initialized {
            HandlerMsg::Init {
                task_id: task.id,
                code,
                dest_dir,
            }
        } else {
            HandlerMsg::Build {
                task_id: task.id,
                code,
                dest_dir,
            }
        };

        debug!(task_id = task.id, ?msg, "requesting task build");
        self.worker.send(msg).await
    }

    /// Delete a task that no job references anymore.
    pub async fn remove_task(&self, task_id: TaskId) -> Result<()> {
        let task = self.require_task(task_id).await?;

        if !self.ledger.jobs_of_task(task_id).await?.is_empty() {
            return Err(JobvisorError::DependentJobs(task_id));
        }

        self.worker
            .send(HandlerMsg::DeleteTask {
                task_id,
                task_type: task.task_type,
            })
            .await?;
        self.ledger.delete_task(task_id).await?;

        let dir = task_dir(&self.content_dir, task_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        info!(task_id, "task removed");
        Ok(())
    }

    /// Manually start a job. Returns the id of the run record.
    pub async fn run_job(&self, job_id: JobId) -> Result<RunId> {
        let job = self
            .ledger
            .get_job(job_id)
            .await?
            .ok_or(JobvisorError::JobNotFound(job_id))?;

        let run_id = self
            .ledger
            .create_run(job_id, RunStatus::Initialization, self.clock.now())
            .await?;

        info!(job_id, run_id, "manual run requested");
        self.worker
            .send(HandlerMsg::Run {
                job_id,
                run_id: Some(run_id),
                task_dir: task_build_output_dir(&self.content_dir, job.task),
            })
            .await?;
        Ok(run_id)
    }

    /// Request cancellation of a run. Unknown runs are ignored.
    pub async fn stop_run(&self, run_id: RunId) -> Result<()> {
        let Some(run) = self.ledger.get_run(run_id).await? else {
            debug!(run_id, "stop requested for unknown run");
            return Ok(());
        };

        self.worker
            .send(HandlerMsg::Stop {
                job_id: run.job,
                run_id,
            })
            .await
    }

    pub async fn remove_run(&self, job_id: JobId, run_id: RunId) -> Result<()> {
        match self.ledger.get_run(run_id).await? {
            Some(run) if run.job == job_id => {}
            _ => return Err(JobvisorError::RunNotFound(run_id)),
        }

        self.stop_run(run_id).await?;
        self.ledger.delete_run(run_id).await
    }

    /// Delete a job together with the signal sets it computed.
    pub async fn remove_job(&self, job_id: JobId) -> Result<()> {
        if self.ledger.get_job(job_id).await?.is_none() {
            return Err(JobvisorError::JobNotFound(job_id));
        }

        self.worker.send(HandlerMsg::DeleteJob { job_id }).await?;

        match self.catalog.delete_sets_owned_by(job_id).await {
            Ok(sets) if !sets.is_empty() => {
                debug!(job_id, ?sets, "removed signal sets owned by job")
            }
            Ok(_) => {}
            Err(err) => warn!(job_id, error = %err, "failed to remove owned signal sets"),
        }

        self.ledger.delete_job(job_id).await?;
        info!(job_id, "job removed");
        Ok(())
    }

    /// New data arrived in the signal set `cid`.
    pub async fn signal_set_changed(&self, cid: impl Into<String>) -> Result<()> {
        self.worker
            .send(HandlerMsg::SignalTrigger {
                source_id: cid.into(),
            })
            .await
    }

    async fn require_task(&self, task_id: TaskId) -> Result<Task> {
        self.ledger
            .get_task(task_id)
            .await?
            .ok_or(JobvisorError::TaskNotFound(task_id))
    }
}
