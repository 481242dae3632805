// src/engine/tracker.rs

//! In-memory run tracking owned by the worker.
//!
//! Pure state, no IO: the worker decides what to do and records it here.
//! A run is in at most one of {queued, delayed, gap-deferred, build-wait,
//! executing}; the queue itself lives in [`super::queue`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::engine::queue::{BuildKind, PreparedRun};
use crate::types::{JobId, RunId, TaskId, TaskType};

/// Admission paused by the job's start delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedRun {
    pub run_id: RunId,
    pub task_dir: PathBuf,
    pub token: u64,
}

/// Admitted run held back until the job's minimal gap has passed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredRun {
    pub run: PreparedRun,
    pub token: u64,
}

/// Run request waiting for its task's build to finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildWait {
    pub task_id: TaskId,
    pub task_name: String,
    pub run_id: RunId,
    pub task_dir: PathBuf,
}

/// Build request that arrived while another build of the same task was
/// running. Only the latest one is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedBuild {
    pub kind: BuildKind,
    pub code: String,
    pub dest_dir: PathBuf,
}

#[derive(Debug)]
struct ActiveBuild {
    generation: u64,
    parked: Option<ParkedBuild>,
}

/// What to do with the result of a finished build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildCompletion {
    /// Not the build currently running for the task.
    Stale,
    /// Latest build of the task; its result stands.
    Latest,
    /// A newer request is waiting and must be started next.
    Superseded(ParkedBuild),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutingRun {
    pub job_id: JobId,
    pub task_type: TaskType,
}

/// Summary of the tracking state, sorted for stable comparisons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerView {
    pub live_jobs: Vec<JobId>,
    pub delayed_runs: Vec<RunId>,
    pub deferred_runs: Vec<RunId>,
    pub build_waiting_runs: Vec<RunId>,
    pub executing_runs: Vec<RunId>,
    pub queued: usize,
}

#[derive(Debug, Default)]
pub struct RunTracker {
    /// Single-flight guard: jobs with a live run in the pipeline.
    live: HashSet<JobId>,
    delayed: HashMap<JobId, DelayedRun>,
    deferred: HashMap<JobId, DeferredRun>,
    build_waits: HashMap<JobId, BuildWait>,
    executing: HashMap<RunId, ExecutingRun>,
    /// Build currently running per task.
    builds: HashMap<TaskId, ActiveBuild>,
    next_token: u64,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self, job: JobId) -> bool {
        self.live.contains(&job)
    }

    /// Mark the job as having a live run. Returns `false` if it already had one.
    pub fn try_acquire(&mut self, job: JobId) -> bool {
        self.live.insert(job)
    }

    pub fn release(&mut self, job: JobId) {
        self.live.remove(&job);
    }

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Record a delayed admission and return the token its timer must present.
    pub fn delay(&mut self, job: JobId, run_id: RunId, task_dir: PathBuf) -> u64 {
        let token = self.next_token();
        self.delayed.insert(
            job,
            DelayedRun {
                run_id,
                task_dir,
                token,
            },
        );
        token
    }

    /// Claim a delayed admission when its timer fires. Stale tokens yield `None`.
    pub fn take_delayed(&mut self, job: JobId, token: u64) -> Option<DelayedRun> {
        match self.delayed.get(&job) {
            Some(d) if d.token == token => self.delayed.remove(&job),
            _ => None,
        }
    }

    pub fn cancel_delayed(&mut self, job: JobId, run_id: RunId) -> Option<DelayedRun> {
        match self.delayed.get(&job) {
            Some(d) if d.run_id == run_id => self.delayed.remove(&job),
            _ => None,
        }
    }

    pub fn defer(&mut self, run: PreparedRun) -> u64 {
        let token = self.next_token();
        self.deferred
            .insert(run.job_id, DeferredRun { run, token });
        token
    }

    pub fn take_deferred(&mut self, job: JobId, token: u64) -> Option<PreparedRun> {
        match self.deferred.get(&job) {
            Some(d) if d.token == token => self.deferred.remove(&job).map(|d| d.run),
            _ => None,
        }
    }

    pub fn cancel_deferred(&mut self, job: JobId, run_id: RunId) -> Option<DeferredRun> {
        match self.deferred.get(&job) {
            Some(d) if d.run.run_id == run_id => self.deferred.remove(&job),
            _ => None,
        }
    }

    pub fn is_waiting_for_build(&self, job: JobId) -> bool {
        self.build_waits.contains_key(&job)
    }

    /// Register a build wait. At most one per job; returns `false` if the job
    /// is already waiting.
    pub fn wait_for_build(&mut self, job: JobId, wait: BuildWait) -> bool {
        if self.build_waits.contains_key(&job) {
            return false;
        }
        self.build_waits.insert(job, wait);
        true
    }

    /// Remove and return every wait on `task`, ordered by job id.
    pub fn take_build_waits(&mut self, task: TaskId) -> Vec<(JobId, BuildWait)> {
        let mut jobs: Vec<JobId> = self
            .build_waits
            .iter()
            .filter(|(_, w)| w.task_id == task)
            .map(|(job, _)| *job)
            .collect();
        jobs.sort_unstable();

        jobs.into_iter()
            .filter_map(|job| self.build_waits.remove(&job).map(|w| (job, w)))
            .collect()
    }

    pub fn cancel_build_wait(&mut self, job: JobId, run_id: RunId) -> Option<BuildWait> {
        match self.build_waits.get(&job) {
            Some(w) if w.run_id == run_id => self.build_waits.remove(&job),
            _ => None,
        }
    }

    pub fn start_executing(&mut self, run_id: RunId, job_id: JobId, task_type: TaskType) {
        self.executing.insert(run_id, ExecutingRun { job_id, task_type });
    }

    pub fn executing(&self, run_id: RunId) -> Option<ExecutingRun> {
        self.executing.get(&run_id).copied()
    }

    /// A run reached a terminal state: forget it and free its job.
    pub fn finish_run(&mut self, job: JobId, run_id: RunId) {
        self.executing.remove(&run_id);
        self.live.remove(&job);
    }

    pub fn is_building(&self, task: TaskId) -> bool {
        self.builds.contains_key(&task)
    }

    /// Start a new build generation for `task`.
    pub fn begin_build(&mut self, task: TaskId) -> u64 {
        let generation = self.next_token();
        self.builds.insert(
            task,
            ActiveBuild {
                generation,
                parked: None,
            },
        );
        generation
    }

    /// Hold `build` until the running build of `task` finishes. A parked
    /// init is never downgraded to a plain build.
    pub fn park_build(&mut self, task: TaskId, mut build: ParkedBuild) {
        let Some(active) = self.builds.get_mut(&task) else {
            return;
        };
        if active.parked.as_ref().is_some_and(|p| p.kind == BuildKind::Init) {
            build.kind = BuildKind::Init;
        }
        active.parked = Some(build);
    }

    /// Finish a build and tell whether its result is current.
    pub fn finish_build(&mut self, task: TaskId, generation: u64) -> BuildCompletion {
        match self.builds.get(&task) {
            Some(active) if active.generation == generation => {}
            _ => return BuildCompletion::Stale,
        }
        match self.builds.remove(&task).and_then(|active| active.parked) {
            Some(parked) => BuildCompletion::Superseded(parked),
            None => BuildCompletion::Latest,
        }
    }

    pub fn view(&self, queued: usize) -> TrackerView {
        let mut view = TrackerView {
            live_jobs: self.live.iter().copied().collect(),
            delayed_runs: self.delayed.values().map(|d| d.run_id).collect(),
            deferred_runs: self.deferred.values().map(|d| d.run.run_id).collect(),
            build_waiting_runs: self.build_waits.values().map(|w| w.run_id).collect(),
            executing_runs: self.executing.keys().copied().collect(),
            queued,
        };
        view.live_jobs.sort_unstable();
        view.delayed_runs.sort_unstable();
        view.deferred_runs.sort_unstable();
        view.build_waiting_runs.sort_unstable();
        view.executing_runs.sort_unstable();
        view
    }
}
