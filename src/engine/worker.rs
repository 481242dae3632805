// src/engine/worker.rs

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{JobvisorError, Result};
use crate::paths::task_build_output_dir;
use crate::trigger::signal::jobs_for_source;
use crate::types::{JobId, RunId, RunStatus, RunUpdate, TaskId, TaskType};

use super::queue::{BuildKind, WorkEntry, WorkQueue};
use super::tracker::RunTracker;
use super::{HandlerMsg, WorkerContext, WorkerEvent, WorkerHandle};

/// Dispatch loop.
///
/// Owns the work queue and the run tracker. Events (front messages, handler
/// completions, timers) are handled as they arrive, each followed by at most
/// one entry of the work queue, in FIFO order. Handler builds
/// and runs are spawned and report back through the event channel, so the
/// loop never waits for a job to finish.
pub struct Worker {
    pub(crate) ctx: WorkerContext,
    pub(crate) tracker: RunTracker,
    pub(crate) queue: WorkQueue,
    /// Pending delay / gap timers by token.
    pub(crate) timers: HashMap<u64, AbortHandle>,
    event_rx: mpsc::Receiver<WorkerEvent>,
    /// Weak so that dropping every [`WorkerHandle`] ends the loop.
    event_tx: mpsc::WeakSender<WorkerEvent>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("tracker", &self.tracker)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(ctx: WorkerContext, capacity: usize) -> (Self, WorkerHandle) {
        let (tx, rx) = mpsc::channel::<WorkerEvent>(capacity.max(1));
        let worker = Self {
            ctx,
            tracker: RunTracker::new(),
            queue: WorkQueue::new(),
            timers: HashMap::new(),
            event_rx: rx,
            event_tx: tx.downgrade(),
        };
        (worker, WorkerHandle::new(tx))
    }

    /// Main event loop.
    ///
    /// - Consumes `WorkerEvent`s, waiting for one only while the queue is
    ///   empty.
    /// - Processes one queued `WorkEntry` after every event, so a steady
    ///   stream of events cannot hold queued work back.
    /// - Exits on `Shutdown` or once every sender is gone.
    pub async fn run(mut self) -> Result<()> {
        info!("jobvisor worker started");

        loop {
            let event = if self.queue.is_empty() {
                self.event_rx.recv().await
            } else {
                match self.event_rx.try_recv() {
                    Ok(event) => Some(event),
                    Err(TryRecvError::Empty) => {
                        self.process_next().await;
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => None,
                }
            };

            match event {
                Some(WorkerEvent::Shutdown) => {
                    info!("shutdown requested; stopping worker");
                    break;
                }
                Some(event) => self.handle_event(event).await,
                None => {
                    info!("worker event channel closed; exiting");
                    break;
                }
            }
            self.process_next().await;
        }

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        info!("worker exiting");
        Ok(())
    }

    async fn process_next(&mut self) {
        if let Some(entry) = self.queue.pop() {
            self.process_entry(entry).await;
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        debug!(?event, "worker received event");

        let result = match event {
            WorkerEvent::Message(msg) => self.handle_message(msg).await,
            WorkerEvent::BuildFinished {
                task_id,
                kind,
                generation,
                outcome,
            } => {
                self.on_build_finished(task_id, kind, generation, outcome)
                    .await
            }
            WorkerEvent::RunFinished {
                job_id,
                run_id,
                outcome,
            } => self.on_run_finished(job_id, run_id, outcome).await,
            WorkerEvent::DelayElapsed { job_id, token } => {
                self.on_delay_elapsed(job_id, token).await
            }
            WorkerEvent::GapElapsed { job_id, token } => {
                self.on_gap_elapsed(job_id, token);
                Ok(())
            }
            WorkerEvent::Inspect(reply) => {
                let _ = reply.send(self.tracker.view(self.queue.len()));
                Ok(())
            }
            WorkerEvent::Shutdown => Ok(()),
        };

        if let Err(err) = result {
            error!(error = %err, "failed to handle worker event");
        }
    }

    async fn handle_message(&mut self, msg: HandlerMsg) -> Result<()> {
        match msg {
            HandlerMsg::Build {
                task_id,
                code,
                dest_dir,
            } => self.queue.push(WorkEntry::Build {
                kind: BuildKind::Build,
                task_id,
                code,
                dest_dir,
            }),
            HandlerMsg::Init {
                task_id,
                code,
                dest_dir,
            } => self.queue.push(WorkEntry::Build {
                kind: BuildKind::Init,
                task_id,
                code,
                dest_dir,
            }),
            HandlerMsg::Run {
                job_id,
                run_id,
                task_dir,
            } => self.handle_run(job_id, run_id, task_dir).await?,
            HandlerMsg::Stop { job_id, run_id } => self.stop_run(job_id, run_id).await,
            HandlerMsg::DeleteTask { task_id, task_type } => {
                self.queue.push(WorkEntry::DeleteTask { task_id, task_type })
            }
            HandlerMsg::DeleteJob { job_id } => self.queue.push(WorkEntry::DeleteJob { job_id }),
            HandlerMsg::SignalTrigger { source_id } => self.trigger_signal(&source_id).await?,
        }
        Ok(())
    }

    async fn process_entry(&mut self, entry: WorkEntry) {
        let result = match entry {
            WorkEntry::Build {
                kind,
                task_id,
                code,
                dest_dir,
            } => self.process_build(kind, task_id, code, dest_dir).await,
            WorkEntry::Run(run) => self.dispatch_run(run).await,
            WorkEntry::DeleteTask { task_id, task_type } => {
                self.delete_task(task_id, task_type).await
            }
            WorkEntry::DeleteJob { job_id } => {
                self.delete_job(job_id).await;
                Ok(())
            }
        };

        if let Err(err) = result {
            error!(error = %err, "failed to process work entry");
        }
    }

    /// Request a run of every enabled job triggered by the signal set `cid`.
    async fn trigger_signal(&mut self, cid: &str) -> Result<()> {
        let jobs = jobs_for_source(
            self.ctx.ledger.as_ref(),
            self.ctx.catalog.as_ref(),
            cid,
        )
        .await?;
        debug!(cid, jobs = jobs.len(), "signal trigger fired");

        for job in jobs {
            let task_dir = task_build_output_dir(&self.ctx.content_dir, job.task);
            if let Err(err) = self.handle_run(job.id, None, task_dir).await {
                error!(job_id = job.id, error = %err, "signal-triggered run failed");
            }
        }
        Ok(())
    }

    async fn delete_task(&mut self, task_id: TaskId, task_type: TaskType) -> Result<()> {
        match self.ctx.handlers.get(task_type) {
            Some(handler) => handler.remove(task_id).await,
            None => {
                warn!(task_id, task_type = %task_type, "handler for type not found");
                Ok(())
            }
        }
    }

    async fn delete_job(&mut self, job_id: JobId) {
        if let Err(err) = self.ctx.snapshots.delete(job_id).await {
            warn!(job_id, error = %err, "failed to delete job state");
        }
    }

    /// Mark a run failed with `output`. Ledger errors are logged only.
    pub(crate) async fn fail_run(&self, run_id: RunId, output: &str) {
        let update = RunUpdate::status(RunStatus::Failed)
            .with_output(output)
            .finished_at(self.ctx.clock.now());
        if let Err(err) = self.ctx.ledger.update_run(run_id, update).await {
            error!(run_id, error = %err, "run couldn't be updated");
        }
    }

    pub(crate) fn schedule_timer(&mut self, token: u64, after: Duration, event: WorkerEvent) {
        let Some(tx) = self.event_tx.upgrade() else {
            warn!(token, "worker channel closed; timer not scheduled");
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event).await;
        });
        self.timers.insert(token, handle.abort_handle());
    }

    pub(crate) fn cancel_timer(&mut self, token: u64) {
        if let Some(timer) = self.timers.remove(&token) {
            timer.abort();
        }
    }

    /// Spawn `fut` and feed the event it resolves to back into the loop.
    pub(crate) fn spawn_completion<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = WorkerEvent> + Send + 'static,
    {
        let tx = self.event_tx.upgrade().ok_or(JobvisorError::ChannelClosed)?;
        tokio::spawn(async move {
            let event = fut.await;
            if tx.send(event).await.is_err() {
                debug!("worker gone; dropping completion");
            }
        });
        Ok(())
    }
}
