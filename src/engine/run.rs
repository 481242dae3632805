// src/engine/run.rs

//! Run coordinator: admission, dispatch, completion and cancellation of job
//! runs.
//!
//! Admission of a run request:
//! 1. job and task must exist and the job's params must be valid;
//! 2. the task must be built; a build in progress parks the request until
//!    the build finishes (one parked request per job);
//! 3. a job with a live run rejects the request ("already running");
//! 4. the job is marked live; a start delay pauses admission on a timer;
//! 5. entity params are resolved;
//! 6. the run is queued, or held back until the job's minimal gap since its
//!    last successful run has passed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::elapsed_since;
use crate::engine::entities::resolve_entities;
use crate::engine::requests::RequestHandle;
use crate::engine::tracker::BuildWait;
use crate::errors::{JobvisorError, Result};
use crate::handler::{RunContext, RunOutcome};
use crate::types::{BuildState, Job, JobId, JobState, RunId, RunStatus, RunUpdate, Task};

use super::queue::{PreparedRun, WorkEntry};
use super::worker::Worker;
use super::{RUN_CANCELLED, WorkerEvent};

impl Worker {
    /// Admit a run request. `run_id` is `None` when no run record exists yet.
    pub(crate) async fn handle_run(
        &mut self,
        job_id: JobId,
        run_id: Option<RunId>,
        task_dir: PathBuf,
    ) -> Result<()> {
        let ledger = Arc::clone(&self.ctx.ledger);

        let Some(job) = ledger.get_job(job_id).await? else {
            return self
                .reject_request(job_id, run_id, false, JobvisorError::JobNotFound(job_id))
                .await;
        };
        let Some(task) = ledger.get_task(job.task).await? else {
            return self
                .reject_request(job_id, run_id, true, JobvisorError::TaskNotFound(job.task))
                .await;
        };
        if job.state == JobState::InvalidParams {
            let err = JobvisorError::InvalidParams {
                task: task.name,
                job: job.name,
            };
            return self.reject_request(job_id, run_id, true, err).await;
        }

        let run_id = match run_id {
            Some(id) => id,
            None => {
                ledger
                    .create_run(job_id, RunStatus::Scheduled, self.ctx.clock.now())
                    .await?
            }
        };

        if task.build_state != BuildState::Finished {
            if !task.build_state.is_transient() {
                let err = JobvisorError::TaskNotBuilt(task.name);
                return self.reject_request(job_id, Some(run_id), true, err).await;
            }

            let wait = BuildWait {
                task_id: task.id,
                task_name: task.name.clone(),
                run_id,
                task_dir,
            };
            if !self.tracker.wait_for_build(job_id, wait) {
                let err = JobvisorError::AlreadyWaitingForBuild(task.name);
                return self.reject_request(job_id, Some(run_id), true, err).await;
            }

            info!(
                job_id,
                run_id,
                task_id = task.id,
                build_state = ?task.build_state,
                "task build in progress; run waits for it"
            );
            return Ok(());
        }

        if !self.tracker.try_acquire(job_id) {
            let err = JobvisorError::AlreadyRunning(job.name);
            return self.reject_request(job_id, Some(run_id), true, err).await;
        }

        if let Some(delay) = job.delay() {
            let token = self.tracker.delay(job_id, run_id, task_dir);
            self.schedule_timer(token, delay, WorkerEvent::DelayElapsed { job_id, token });
            info!(job_id, run_id, delay_secs = delay.as_secs(), "run start delayed");
            return Ok(());
        }

        self.admit_live(job, task, run_id, task_dir).await;
        Ok(())
    }

    /// Steps 5 and 6 for a job that already holds the single-flight guard.
    /// Any failure fails the run and releases the guard.
    async fn admit_live(&mut self, job: Job, task: Task, run_id: RunId, task_dir: PathBuf) {
        let job_id = job.id;
        if let Err(err) = self.enqueue_run(job, task, run_id, task_dir).await {
            warn!(job_id, run_id, error = %err, "run admission failed");
            self.tracker.release(job_id);
            self.fail_run(run_id, &err.to_string()).await;
        }
    }

    async fn enqueue_run(
        &mut self,
        job: Job,
        task: Task,
        run_id: RunId,
        task_dir: PathBuf,
    ) -> Result<()> {
        let entities = resolve_entities(
            self.ctx.catalog.as_ref(),
            &job.params,
            &task.settings.params,
        )
        .await?;

        if let Err(err) = self
            .ctx
            .ledger
            .update_run(run_id, RunUpdate::status(RunStatus::Scheduled))
            .await
        {
            error!(run_id, error = %err, "run couldn't be updated");
        }

        let gap = self.remaining_gap(&job).await?;
        let run = PreparedRun {
            job_id: job.id,
            run_id,
            task_id: task.id,
            task_type: task.task_type,
            params: job.params,
            entities,
            task_dir,
        };

        match gap {
            Some(remaining) => {
                let job_id = run.job_id;
                let token = self.tracker.defer(run);
                self.schedule_timer(token, remaining, WorkerEvent::GapElapsed { job_id, token });
                info!(
                    job_id,
                    run_id,
                    remaining_ms = remaining.as_millis() as u64,
                    "minimal gap not reached; run deferred"
                );
            }
            None => self.queue.push(WorkEntry::Run(run)),
        }
        Ok(())
    }

    /// Time left until the job's minimal gap since its last successful run
    /// has passed, `None` if it can run now.
    async fn remaining_gap(&self, job: &Job) -> Result<Option<Duration>> {
        let Some(gap) = job.min_gap() else {
            return Ok(None);
        };
        let Some(last) = self.ctx.ledger.last_successful_run(job.id).await? else {
            return Ok(None);
        };
        let Some(started) = last.started_at else {
            return Ok(None);
        };

        let elapsed = elapsed_since(self.ctx.clock.now(), started);
        Ok(gap.checked_sub(elapsed).filter(|d| !d.is_zero()))
    }

    pub(crate) async fn on_delay_elapsed(&mut self, job_id: JobId, token: u64) -> Result<()> {
        self.timers.remove(&token);
        let Some(delayed) = self.tracker.take_delayed(job_id, token) else {
            debug!(job_id, token, "ignoring stale delay timer");
            return Ok(());
        };
        debug!(job_id, run_id = delayed.run_id, "start delay elapsed");

        let ledger = Arc::clone(&self.ctx.ledger);
        let loaded = async {
            let job = ledger
                .get_job(job_id)
                .await?
                .ok_or(JobvisorError::JobNotFound(job_id))?;
            let task = ledger
                .get_task(job.task)
                .await?
                .ok_or(JobvisorError::TaskNotFound(job.task))?;
            Ok::<_, JobvisorError>((job, task))
        }
        .await;

        match loaded {
            Ok((job, task)) => self.admit_live(job, task, delayed.run_id, delayed.task_dir).await,
            Err(err) => {
                warn!(job_id, run_id = delayed.run_id, error = %err, "delayed run failed");
                self.tracker.release(job_id);
                self.fail_run(delayed.run_id, &err.to_string()).await;
            }
        }
        Ok(())
    }

    pub(crate) fn on_gap_elapsed(&mut self, job_id: JobId, token: u64) {
        self.timers.remove(&token);
        match self.tracker.take_deferred(job_id, token) {
            Some(run) => {
                debug!(job_id, run_id = run.run_id, "minimal gap elapsed; queueing run");
                self.queue.push(WorkEntry::Run(run));
            }
            None => debug!(job_id, token, "ignoring stale gap timer"),
        }
    }

    /// Hand a queued run to its type handler without waiting for it.
    pub(crate) async fn dispatch_run(&mut self, run: PreparedRun) -> Result<()> {
        let PreparedRun {
            job_id,
            run_id,
            task_type,
            params,
            entities,
            task_dir,
            ..
        } = run;

        let Some(handler) = self.ctx.handlers.get(task_type) else {
            let err = JobvisorError::HandlerNotFound(task_type.to_string());
            error!(job_id, run_id, error = %err, "cannot dispatch run");
            self.tracker.finish_run(job_id, run_id);
            self.fail_run(run_id, &err.to_string()).await;
            return Ok(());
        };

        let update = RunUpdate::status(RunStatus::Running).started_at(self.ctx.clock.now());
        if let Err(err) = self.ctx.ledger.update_run(run_id, update).await {
            error!(run_id, error = %err, "run couldn't be updated");
        }

        let previous_state = match self.ctx.snapshots.load(job_id).await {
            Ok(state) => state,
            Err(err) => {
                error!(job_id, error = %err, "failed to load job state");
                None
            }
        };

        self.tracker.start_executing(run_id, job_id, task_type);

        let ctx = RunContext {
            job_id,
            run_id,
            params,
            entities,
            previous_state,
            work_dir: task_dir,
            requests: RequestHandle::new(
                job_id,
                Arc::clone(&self.ctx.catalog),
                Arc::clone(&self.ctx.snapshots),
            ),
        };

        info!(job_id, run_id, task_type = %task_type, "dispatching run to handler");
        let execution = handler.run(ctx);

        if let Err(err) = self.spawn_completion(async move {
            WorkerEvent::RunFinished {
                job_id,
                run_id,
                outcome: execution.await,
            }
        }) {
            self.tracker.finish_run(job_id, run_id);
            self.fail_run(run_id, &err.to_string()).await;
        }
        Ok(())
    }

    pub(crate) async fn on_run_finished(
        &mut self,
        job_id: JobId,
        run_id: RunId,
        outcome: RunOutcome,
    ) -> Result<()> {
        // Free the job first; a failing ledger write must not keep it stuck.
        self.tracker.finish_run(job_id, run_id);
        let now = self.ctx.clock.now();

        match outcome {
            RunOutcome::Success { output, new_state } => {
                info!(job_id, run_id, "run succeeded");
                let update = RunUpdate::status(RunStatus::Success)
                    .with_output(output)
                    .finished_at(now);
                if let Err(err) = self.ctx.ledger.update_run(run_id, update).await {
                    error!(run_id, error = %err, "run couldn't be updated");
                }
                if let Some(state) = new_state {
                    if let Err(err) = self.ctx.snapshots.store(job_id, state).await {
                        warn!(job_id, error = %err, "failed to store job state");
                    }
                }
            }
            RunOutcome::Failure(err) => {
                info!(job_id, run_id, "run failed");
                let update = RunUpdate::status(RunStatus::Failed)
                    .with_output(err)
                    .finished_at(now);
                if let Err(err) = self.ctx.ledger.update_run(run_id, update).await {
                    error!(run_id, error = %err, "run couldn't be updated");
                }
            }
        }
        Ok(())
    }

    /// Cancel a run wherever it currently is. Unknown or finished runs are
    /// ignored, which makes repeated stops harmless.
    pub(crate) async fn stop_run(&mut self, job_id: JobId, run_id: RunId) {
        if let Some(run) = self.queue.remove_run(run_id) {
            info!(job_id = run.job_id, run_id, "removed queued run");
            self.tracker.release(run.job_id);
            self.fail_run(run_id, RUN_CANCELLED).await;
            return;
        }

        if let Some(executing) = self.tracker.executing(run_id) {
            // The handler's own completion finalizes the run.
            match self.ctx.handlers.get(executing.task_type) {
                Some(handler) => {
                    info!(job_id = executing.job_id, run_id, "stopping executing run");
                    if let Err(err) = handler.stop(run_id).await {
                        error!(run_id, error = %err, "handler failed to stop run");
                    }
                }
                None => warn!(run_id, "handler for executing run vanished"),
            }
            return;
        }

        if self.tracker.cancel_build_wait(job_id, run_id).is_some() {
            info!(job_id, run_id, "cancelled run waiting for build");
            self.fail_run(run_id, RUN_CANCELLED).await;
            return;
        }

        if let Some(delayed) = self.tracker.cancel_delayed(job_id, run_id) {
            info!(job_id, run_id, "cancelled delayed run");
            self.cancel_timer(delayed.token);
            self.tracker.release(job_id);
            self.fail_run(run_id, RUN_CANCELLED).await;
            return;
        }

        if let Some(deferred) = self.tracker.cancel_deferred(job_id, run_id) {
            info!(job_id, run_id, "cancelled run held back by minimal gap");
            self.cancel_timer(deferred.token);
            self.tracker.release(job_id);
            self.fail_run(run_id, RUN_CANCELLED).await;
            return;
        }

        debug!(job_id, run_id, "run is not active; nothing to stop");
    }

    /// Terminate a request that failed before acquiring the single-flight
    /// guard. Without a run record one is created when `attach` is set (the
    /// job exists); otherwise the failure is only logged.
    async fn reject_request(
        &self,
        job_id: JobId,
        run_id: Option<RunId>,
        attach: bool,
        err: JobvisorError,
    ) -> Result<()> {
        warn!(job_id, ?run_id, error = %err, "run request rejected");
        let output = err.to_string();

        match run_id {
            Some(run_id) => self.fail_run(run_id, &output).await,
            None if attach => {
                let now = self.ctx.clock.now();
                let run_id = self
                    .ctx
                    .ledger
                    .create_run(job_id, RunStatus::Failed, now)
                    .await?;
                self.fail_run(run_id, &output).await;
            }
            None => error!(job_id, "job run failed: {output}"),
        }
        Ok(())
    }
}
