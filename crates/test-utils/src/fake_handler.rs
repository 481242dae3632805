use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use jobvisor::engine::{BuildKind, RUN_CANCELLED};
use jobvisor::errors::Result;
use jobvisor::handler::{BuildOutcome, HandlerFuture, RunContext, RunOutcome, TypeHandler};
use jobvisor::types::{RunId, TaskId};

/// How the fake resolves the futures it hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Resolve right away with the configured outcome.
    Immediate,
    /// Stay pending until the test calls `complete_build` / `finish_run`
    /// (or, for runs, until the run is stopped).
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildCall {
    pub kind: BuildKind,
    pub task: TaskId,
    pub code: String,
    pub dest_dir: PathBuf,
}

/// Everything the engine asked the fake to do, in call order.
#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub builds: Vec<BuildCall>,
    pub runs: Vec<RunContext>,
    pub stops: Vec<RunId>,
    pub removes: Vec<TaskId>,
}

impl Calls {
    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.iter().map(|r| r.run_id).collect()
    }
}

/// A type handler that spawns nothing:
/// - records every call
/// - completes builds and runs either immediately or when the test says so
/// - answers `stop` by failing the pending run with "Run cancelled."
pub struct FakeHandler {
    calls: watch::Sender<Calls>,
    build_mode: Completion,
    run_mode: Completion,
    build_outcomes: Mutex<HashMap<TaskId, BuildOutcome>>,
    run_outcome: Mutex<RunOutcome>,
    pending_builds: Mutex<HashMap<TaskId, oneshot::Sender<BuildOutcome>>>,
    pending_runs: Mutex<HashMap<RunId, oneshot::Sender<RunOutcome>>>,
}

impl FakeHandler {
    pub fn new() -> Self {
        Self {
            calls: watch::Sender::new(Calls::default()),
            build_mode: Completion::Immediate,
            run_mode: Completion::Immediate,
            build_outcomes: Mutex::new(HashMap::new()),
            run_outcome: Mutex::new(RunOutcome::Success {
                output: "ok".to_string(),
                new_state: None,
            }),
            pending_builds: Mutex::new(HashMap::new()),
            pending_runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn manual_builds(mut self) -> Self {
        self.build_mode = Completion::Manual;
        self
    }

    pub fn manual_runs(mut self) -> Self {
        self.run_mode = Completion::Manual;
        self
    }

    /// Outcome of immediate builds of `task` (default: success).
    pub fn set_build_outcome(&self, task: TaskId, outcome: BuildOutcome) {
        self.build_outcomes.lock().insert(task, outcome);
    }

    /// Outcome of immediate runs (default: success with output "ok").
    pub fn set_run_outcome(&self, outcome: RunOutcome) {
        *self.run_outcome.lock() = outcome;
    }

    /// Resolve the pending build of `task`. Returns `false` if none is pending.
    pub fn complete_build(&self, task: TaskId, outcome: BuildOutcome) -> bool {
        match self.pending_builds.lock().remove(&task) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Resolve the pending run `run`. Returns `false` if none is pending.
    pub fn finish_run(&self, run: RunId, outcome: RunOutcome) -> bool {
        match self.pending_runs.lock().remove(&run) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn calls(&self) -> Calls {
        self.calls.borrow().clone()
    }

    /// Wait until the recorded calls satisfy `cond`.
    pub async fn wait_for<F>(&self, mut cond: F) -> Calls
    where
        F: FnMut(&Calls) -> bool,
    {
        let mut rx = self.calls.subscribe();
        let calls = rx
            .wait_for(|calls| cond(calls))
            .await
            .expect("fake handler dropped");
        calls.clone()
    }

    pub async fn wait_for_builds(&self, n: usize) -> Calls {
        self.wait_for(|c| c.builds.len() >= n).await
    }

    pub async fn wait_for_runs(&self, n: usize) -> Calls {
        self.wait_for(|c| c.runs.len() >= n).await
    }

    fn start_build(
        &self,
        kind: BuildKind,
        task: TaskId,
        code: String,
        dest_dir: PathBuf,
    ) -> HandlerFuture<'static, BuildOutcome> {
        let fut: HandlerFuture<'static, BuildOutcome> = match self.build_mode {
            Completion::Immediate => {
                let outcome = self
                    .build_outcomes
                    .lock()
                    .get(&task)
                    .cloned()
                    .unwrap_or_else(BuildOutcome::success);
                Box::pin(async move { outcome })
            }
            Completion::Manual => {
                let (tx, rx) = oneshot::channel();
                self.pending_builds.lock().insert(task, tx);
                Box::pin(async move {
                    rx.await
                        .unwrap_or_else(|_| BuildOutcome::failure("build abandoned"))
                })
            }
        };

        self.calls.send_modify(|c| {
            c.builds.push(BuildCall {
                kind,
                task,
                code,
                dest_dir,
            })
        });
        fut
    }
}

impl Default for FakeHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeHandler for FakeHandler {
    fn build(
        &self,
        task: TaskId,
        code: String,
        dest_dir: PathBuf,
    ) -> HandlerFuture<'static, BuildOutcome> {
        self.start_build(BuildKind::Build, task, code, dest_dir)
    }

    fn init(
        &self,
        task: TaskId,
        code: String,
        dest_dir: PathBuf,
    ) -> HandlerFuture<'static, BuildOutcome> {
        self.start_build(BuildKind::Init, task, code, dest_dir)
    }

    fn run(&self, ctx: RunContext) -> HandlerFuture<'static, RunOutcome> {
        let fut: HandlerFuture<'static, RunOutcome> = match self.run_mode {
            Completion::Immediate => {
                let outcome = self.run_outcome.lock().clone();
                Box::pin(async move { outcome })
            }
            Completion::Manual => {
                let (tx, rx) = oneshot::channel();
                self.pending_runs.lock().insert(ctx.run_id, tx);
                Box::pin(async move {
                    rx.await
                        .unwrap_or_else(|_| RunOutcome::Failure(RUN_CANCELLED.to_string()))
                })
            }
        };

        self.calls.send_modify(|c| c.runs.push(ctx));
        fut
    }

    fn stop(&self, run: RunId) -> HandlerFuture<'_, Result<()>> {
        let pending = self.pending_runs.lock().remove(&run);
        self.calls.send_modify(|c| c.stops.push(run));
        if let Some(tx) = pending {
            let _ = tx.send(RunOutcome::Failure(RUN_CANCELLED.to_string()));
        }
        Box::pin(async { Ok(()) })
    }

    fn remove(&self, task: TaskId) -> HandlerFuture<'_, Result<()>> {
        self.calls.send_modify(|c| c.removes.push(task));
        Box::pin(async { Ok(()) })
    }
}
