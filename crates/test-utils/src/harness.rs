use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::task::JoinHandle;

use jobvisor::clock::{Clock, TokioClock};
use jobvisor::engine::{HandlerMsg, TrackerView, Worker, WorkerContext, WorkerHandle};
use jobvisor::front::Control;
use jobvisor::handler::HandlerRegistry;
use jobvisor::ledger::{Ledger, MemoryLedger};
use jobvisor::paths::task_build_output_dir;
use jobvisor::snapshot::MemorySnapshotStore;
use jobvisor::types::{BuildState, JobId, JobRun, RunId, RunStatus, Task, TaskId, TaskType};

use crate::builders::{JobBuilder, TaskBuilder};
use crate::fake_handler::FakeHandler;

/// A running worker wired to in-memory collaborators and a [`FakeHandler`]
/// registered for every task type.
///
/// The clock follows tokio time, so tests using `start_paused` control the
/// wall clock the engine sees.
pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub snapshots: Arc<MemorySnapshotStore>,
    pub handler: Arc<FakeHandler>,
    pub clock: Arc<TokioClock>,
    pub handle: WorkerHandle,
    pub content_dir: PathBuf,
    worker: JoinHandle<jobvisor::errors::Result<()>>,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_handler(FakeHandler::new())
    }

    pub fn with_handler(handler: FakeHandler) -> Self {
        Self::with_ledger(handler, MemoryLedger::new())
    }

    /// Start a worker on top of a pre-populated ledger.
    pub fn with_ledger(handler: FakeHandler, ledger: MemoryLedger) -> Self {
        crate::init_tracing();

        let ledger = Arc::new(ledger);
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let handler = Arc::new(handler);
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid start time");
        let clock = Arc::new(TokioClock::new(start));
        let content_dir = PathBuf::from("content");

        let mut handlers = HandlerRegistry::new();
        handlers.register(TaskType::Python, handler.clone());
        handlers.register(TaskType::Numpy, handler.clone());

        let ctx = WorkerContext {
            ledger: ledger.clone(),
            catalog: ledger.clone(),
            snapshots: snapshots.clone(),
            handlers,
            clock: clock.clone(),
            content_dir: content_dir.clone(),
        };
        let (worker, handle) = Worker::new(ctx, 64);
        let worker = tokio::spawn(worker.run());

        Self {
            ledger,
            snapshots,
            handler,
            clock,
            handle,
            content_dir,
            worker,
        }
    }

    pub fn control(&self) -> Control {
        Control::new(
            self.ledger.clone(),
            self.ledger.clone(),
            self.handle.clone(),
            self.clock.clone(),
            self.content_dir.clone(),
        )
    }

    pub async fn add_task(&self, task: TaskBuilder) -> TaskId {
        self.ledger
            .insert_task(task.build())
            .await
            .expect("insert task")
    }

    pub async fn add_job(&self, job: JobBuilder) -> JobId {
        self.ledger.insert_job(job.build()).await.expect("insert job")
    }

    /// Task with one enabled job attached.
    pub async fn add_task_and_job(&self, job: impl FnOnce(JobBuilder) -> JobBuilder) -> (TaskId, JobId) {
        let task = self.add_task(TaskBuilder::new("task")).await;
        let job = self.add_job(job(JobBuilder::new(task))).await;
        (task, job)
    }

    pub async fn send(&self, msg: HandlerMsg) {
        self.handle.send(msg).await.expect("worker alive");
    }

    /// Request a run the way triggers do: without a run record.
    pub async fn request_run(&self, job_id: JobId) {
        let job = self.job_task(job_id).await;
        self.send(HandlerMsg::Run {
            job_id,
            run_id: None,
            task_dir: task_build_output_dir(&self.content_dir, job),
        })
        .await;
    }

    /// Request a run for an existing run record, the way the front does.
    pub async fn request_run_with_id(&self, job_id: JobId, run_id: RunId) {
        let job = self.job_task(job_id).await;
        self.send(HandlerMsg::Run {
            job_id,
            run_id: Some(run_id),
            task_dir: task_build_output_dir(&self.content_dir, job),
        })
        .await;
    }

    async fn job_task(&self, job_id: JobId) -> TaskId {
        self.ledger
            .get_job(job_id)
            .await
            .expect("ledger")
            .map(|j| j.task)
            .unwrap_or_default()
    }

    pub async fn stop(&self, job_id: JobId, run_id: RunId) {
        self.send(HandlerMsg::Stop { job_id, run_id }).await;
    }

    pub async fn new_run(&self, job_id: JobId) -> RunId {
        self.ledger
            .create_run(job_id, RunStatus::Initialization, self.clock.now())
            .await
            .expect("create run")
    }

    pub async fn run(&self, run_id: RunId) -> JobRun {
        self.ledger
            .get_run(run_id)
            .await
            .expect("ledger")
            .expect("run exists")
    }

    pub async fn task(&self, task_id: TaskId) -> Task {
        self.ledger
            .get_task(task_id)
            .await
            .expect("ledger")
            .expect("task exists")
    }

    /// All runs of a job, oldest first.
    pub async fn runs_of(&self, job_id: JobId) -> Vec<JobRun> {
        let all = [
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Scheduled,
            RunStatus::Running,
            RunStatus::Initialization,
        ];
        let mut runs: Vec<JobRun> = self
            .ledger
            .runs_with_status(&all)
            .await
            .expect("ledger")
            .into_iter()
            .filter(|r| r.job == job_id)
            .collect();
        runs.sort_by_key(|r| r.id);
        runs
    }

    /// Poll the ledger until the run reaches `status`.
    pub async fn wait_for_run_status(&self, run_id: RunId, status: RunStatus) -> JobRun {
        crate::with_timeout(async {
            loop {
                if let Some(run) = self.ledger.get_run(run_id).await.expect("ledger") {
                    if run.status == status {
                        return run;
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
    }

    /// Poll the ledger until the job has `n` runs.
    pub async fn wait_for_run_count(&self, job_id: JobId, n: usize) -> Vec<JobRun> {
        crate::with_timeout(async {
            loop {
                let runs = self.runs_of(job_id).await;
                if runs.len() >= n {
                    return runs;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
    }

    pub async fn wait_for_build_state(&self, task_id: TaskId, state: BuildState) -> Task {
        crate::with_timeout(async {
            loop {
                let task = self.task(task_id).await;
                if task.build_state == state {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
    }

    /// Poll the worker until its tracking state satisfies `cond`.
    pub async fn wait_for_view<F>(&self, mut cond: F) -> TrackerView
    where
        F: FnMut(&TrackerView) -> bool,
    {
        crate::with_timeout(async {
            loop {
                let view = self.view().await;
                if cond(&view) {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
    }

    pub async fn view(&self) -> TrackerView {
        self.handle.inspect().await.expect("worker alive")
    }

    pub async fn shutdown(self) {
        let _ = self.handle.shutdown().await;
        let _ = self.worker.await;
    }
}
