// src/engine/build.rs

//! Build coordinator: drives the task build state machine.
//!
//! ```text
//! Uninitialized -> Initializing -> Finished | Uninitialized
//! Scheduled     -> Processing   -> Finished | Failed
//! ```
//!
//! A task builds at most once at a time: a request arriving meanwhile is
//! parked and started when the running build finishes. Until an init has
//! succeeded, every request is carried out as an init. Only the result of the
//! latest build wakes the runs waiting on the task.

use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::errors::{JobvisorError, Result};
use crate::handler::BuildOutcome;
use crate::types::{BuildState, TaskId};

use super::queue::{BuildKind, WorkEntry};
use super::tracker::{BuildCompletion, ParkedBuild};
use super::worker::Worker;
use super::WorkerEvent;

impl Worker {
    pub(crate) async fn process_build(
        &mut self,
        kind: BuildKind,
        task_id: TaskId,
        code: String,
        dest_dir: PathBuf,
    ) -> Result<()> {
        let Some(task) = self.ctx.ledger.get_task(task_id).await? else {
            warn!(task_id, %kind, "task not found; skipping build");
            return Ok(());
        };

        if self.tracker.is_building(task_id) {
            info!(task_id, %kind, "task is already building; parking request");
            self.tracker.park_build(
                task_id,
                ParkedBuild {
                    kind,
                    code,
                    dest_dir,
                },
            );
            return Ok(());
        }

        let kind = if task.initialized {
            kind
        } else {
            if kind == BuildKind::Build {
                debug!(task_id, "task was never initialized; building with init");
            }
            BuildKind::Init
        };

        let generation = self.tracker.begin_build(task_id);

        let Some(handler) = self.ctx.handlers.get(task.task_type) else {
            let err = JobvisorError::HandlerNotFound(task.task_type.to_string());
            warn!(task_id, %kind, error = %err, "cannot build task");
            return self
                .on_build_finished(task_id, kind, generation, BuildOutcome::failure(err.to_string()))
                .await;
        };

        let state = match kind {
            BuildKind::Build => BuildState::Processing,
            BuildKind::Init => BuildState::Initializing,
        };
        self.ctx.ledger.set_build_state(task_id, state, None).await?;

        info!(task_id, %kind, task_type = %task.task_type, "starting task build");
        let build = match kind {
            BuildKind::Build => handler.build(task_id, code, dest_dir),
            BuildKind::Init => handler.init(task_id, code, dest_dir),
        };

        self.spawn_completion(async move {
            WorkerEvent::BuildFinished {
                task_id,
                kind,
                generation,
                outcome: build.await,
            }
        })
    }

    pub(crate) async fn on_build_finished(
        &mut self,
        task_id: TaskId,
        kind: BuildKind,
        generation: u64,
        outcome: BuildOutcome,
    ) -> Result<()> {
        let completion = self.tracker.finish_build(task_id, generation);
        if completion == BuildCompletion::Stale {
            debug!(task_id, generation, "ignoring result of a stale build");
            return Ok(());
        }

        let success = outcome.is_success();
        let state = match (success, kind) {
            (true, _) => BuildState::Finished,
            (false, BuildKind::Build) => BuildState::Failed,
            // Force re-initialization on the next edit.
            (false, BuildKind::Init) => BuildState::Uninitialized,
        };

        if success {
            info!(task_id, %kind, "task build finished");
        } else {
            warn!(task_id, %kind, output = ?outcome.to_output(), "task build failed");
        }

        if let Err(err) = self
            .ctx
            .ledger
            .set_build_state(task_id, state, Some(outcome.to_output()))
            .await
        {
            error!(task_id, error = %err, "failed to persist build result");
        }

        match completion {
            BuildCompletion::Superseded(next) => {
                debug!(task_id, kind = %next.kind, "starting parked build");
                self.queue.push(WorkEntry::Build {
                    kind: next.kind,
                    task_id,
                    code: next.code,
                    dest_dir: next.dest_dir,
                });
            }
            _ => self.resume_build_waits(task_id, success).await,
        }
        Ok(())
    }

    async fn resume_build_waits(&mut self, task_id: TaskId, success: bool) {
        for (job_id, wait) in self.tracker.take_build_waits(task_id) {
            if success {
                debug!(job_id, run_id = wait.run_id, "resuming run after build");
                if let Err(err) = self.handle_run(job_id, Some(wait.run_id), wait.task_dir).await {
                    error!(job_id, run_id = wait.run_id, error = %err, "resumed run failed");
                }
            } else {
                let err = JobvisorError::TaskNotBuilt(wait.task_name);
                info!(job_id, run_id = wait.run_id, error = %err, "build failed; failing waiting run");
                self.fail_run(wait.run_id, &err.to_string()).await;
            }
        }
    }
}
