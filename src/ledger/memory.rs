// src/ledger/memory.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{JobvisorError, Result};
use crate::ledger::file::{load_state, save_state};
use crate::ledger::{CreatedSignalSet, Ledger, NewJob, NewSignalSet, NewTask, SignalCatalog};
use crate::types::{
    BuildOutput, BuildState, Job, JobId, JobRun, JobState, RunId, RunStatus, RunUpdate, Signal,
    SignalId, SignalSet, SignalSetId, Task, TaskId, TaskSettings,
};

/// Everything the ledger knows, in one serializable value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerState {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    tasks: BTreeMap<TaskId, Task>,
    #[serde(default)]
    jobs: BTreeMap<JobId, Job>,
    #[serde(default)]
    runs: BTreeMap<RunId, JobRun>,
    #[serde(default)]
    signal_sets: BTreeMap<SignalSetId, SignalSet>,
    #[serde(default)]
    signals: BTreeMap<SignalId, Signal>,
    /// (job, signal set) pairs for computed sets created by jobs.
    #[serde(default)]
    set_owners: Vec<(JobId, SignalSetId)>,
}

impl LedgerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Ledger kept in memory, optionally mirrored to a JSON file after every
/// mutation (see [`MemoryLedger::open`]).
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    persist_to: Option<FileMirror>,
}

/// Target of the JSON mirror. Writes are serialized by `write_lock` so the
/// file always ends up holding the latest committed state.
#[derive(Debug)]
struct FileMirror {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file-backed ledger, loading existing state if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = load_state(&path)?;
        debug!(path = ?path, tasks = state.tasks.len(), runs = state.runs.len(), "opened ledger file");
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            persist_to: Some(FileMirror {
                path,
                write_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Register a signal set directly (used when seeding data).
    pub async fn insert_signal_set(&self, cid: &str, namespace: u64) -> Result<SignalSet> {
        self.mutate(|state| {
            let set = SignalSet {
                id: state.next_id(),
                cid: cid.to_string(),
                namespace,
                computed: false,
            };
            state.signal_sets.insert(set.id, set.clone());
            Ok(set)
        })
        .await
    }

    /// Register a signal inside an existing set.
    pub async fn insert_signal(&self, set: SignalSetId, cid: &str) -> Result<Signal> {
        self.mutate(|state| {
            let namespace = state
                .signal_sets
                .get(&set)
                .map(|s| s.namespace)
                .ok_or_else(|| JobvisorError::Ledger(format!("signal set {set} not found")))?;
            let signal = Signal {
                id: state.next_id(),
                set,
                cid: cid.to_string(),
                namespace,
            };
            state.signals.insert(signal.id, signal.clone());
            Ok(signal)
        })
        .await
    }

    fn read<R>(&self, f: impl FnOnce(&LedgerState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Apply `f` to the state in place, then mirror the result to disk.
    ///
    /// Every `f` checks its preconditions before touching the state, so an
    /// `Err` from `f` leaves nothing half-applied.
    async fn mutate<R>(&self, f: impl FnOnce(&mut LedgerState) -> Result<R>) -> Result<R> {
        let Some(mirror) = &self.persist_to else {
            return f(&mut self.state.lock());
        };

        let _writing = mirror.write_lock.lock().await;
        let out = f(&mut self.state.lock())?;

        let state = Arc::clone(&self.state);
        let path = mirror.path.clone();
        tokio::task::spawn_blocking(move || {
            let body = serde_json::to_vec_pretty(&*state.lock())?;
            save_state(&path, &body)
        })
        .await
        .map_err(|err| JobvisorError::Ledger(format!("ledger writer failed: {err}")))??;

        Ok(out)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_task(&self, task: NewTask) -> Result<TaskId> {
        self.mutate(|state| {
            let id = state.next_id();
            state.tasks.insert(
                id,
                Task {
                    id,
                    name: task.name,
                    task_type: task.task_type,
                    settings: task.settings,
                    build_state: task.build_state,
                    build_output: None,
                    initialized: task.initialized,
                },
            );
            Ok(id)
        })
        .await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.read(|state| state.tasks.get(&id).cloned()))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.read(|state| state.tasks.values().cloned().collect()))
    }

    async fn update_task(&self, id: TaskId, name: String, settings: TaskSettings) -> Result<()> {
        self.mutate(|state| {
            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(JobvisorError::TaskNotFound(id))?;
            task.name = name;
            task.settings = settings;
            Ok(())
        })
        .await
    }

    async fn delete_task(&self, id: TaskId) -> Result<()> {
        self.mutate(|state| {
            state.tasks.remove(&id);
            Ok(())
        })
        .await
    }

    async fn set_build_state(
        &self,
        id: TaskId,
        build_state: BuildState,
        output: Option<BuildOutput>,
    ) -> Result<()> {
        self.mutate(|state| {
            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(JobvisorError::TaskNotFound(id))?;
            task.build_state = build_state;
            match build_state {
                BuildState::Finished => task.initialized = true,
                BuildState::Uninitialized => task.initialized = false,
                _ => {}
            }
            if output.is_some() {
                task.build_output = output;
            }
            Ok(())
        })
        .await
    }

    async fn tasks_in_build_states(&self, states: &[BuildState]) -> Result<Vec<Task>> {
        Ok(self.read(|state| {
            state
                .tasks
                .values()
                .filter(|t| states.contains(&t.build_state))
                .cloned()
                .collect()
        }))
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobId> {
        self.mutate(|state| {
            if !state.tasks.contains_key(&job.task) {
                return Err(JobvisorError::TaskNotFound(job.task));
            }
            let id = state.next_id();
            state.jobs.insert(
                id,
                Job {
                    id,
                    name: job.name,
                    task: job.task,
                    params: job.params,
                    state: job.state,
                    trigger: job.trigger,
                    min_gap: job.min_gap,
                    delay: job.delay,
                    signal_set_triggers: job.signal_set_triggers,
                },
            );
            Ok(id)
        })
        .await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.read(|state| state.jobs.get(&id).cloned()))
    }

    async fn jobs_by_state(&self, job_state: JobState) -> Result<Vec<Job>> {
        Ok(self.read(|state| {
            state
                .jobs
                .values()
                .filter(|j| j.state == job_state)
                .cloned()
                .collect()
        }))
    }

    async fn jobs_of_task(&self, task: TaskId) -> Result<Vec<Job>> {
        Ok(self.read(|state| {
            state
                .jobs
                .values()
                .filter(|j| j.task == task)
                .cloned()
                .collect()
        }))
    }

    async fn jobs_triggered_by(&self, set: SignalSetId) -> Result<Vec<Job>> {
        Ok(self.read(|state| {
            state
                .jobs
                .values()
                .filter(|j| j.signal_set_triggers.contains(&set))
                .cloned()
                .collect()
        }))
    }

    async fn set_job_state(&self, id: JobId, job_state: JobState) -> Result<()> {
        self.mutate(|state| {
            let job = state
                .jobs
                .get_mut(&id)
                .ok_or(JobvisorError::JobNotFound(id))?;
            job.state = job_state;
            Ok(())
        })
        .await
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        self.mutate(|state| {
            state.jobs.remove(&id);
            state.set_owners.retain(|(owner, _)| *owner != id);
            Ok(())
        })
        .await
    }

    async fn create_run(
        &self,
        job: JobId,
        status: RunStatus,
        started_at: DateTime<Utc>,
    ) -> Result<RunId> {
        self.mutate(|state| {
            let id = state.next_id();
            state.runs.insert(
                id,
                JobRun {
                    id,
                    job,
                    status,
                    started_at: Some(started_at),
                    finished_at: None,
                    output: String::new(),
                },
            );
            Ok(id)
        })
        .await
    }

    async fn get_run(&self, id: RunId) -> Result<Option<JobRun>> {
        Ok(self.read(|state| state.runs.get(&id).cloned()))
    }

    async fn update_run(&self, id: RunId, update: RunUpdate) -> Result<()> {
        self.mutate(|state| {
            let run = state
                .runs
                .get_mut(&id)
                .ok_or(JobvisorError::RunNotFound(id))?;
            update.apply(run);
            Ok(())
        })
        .await
    }

    async fn last_successful_run(&self, job: JobId) -> Result<Option<JobRun>> {
        Ok(self.read(|state| {
            state
                .runs
                .values()
                .filter(|r| r.job == job && r.status == RunStatus::Success)
                .max_by_key(|r| r.started_at)
                .cloned()
        }))
    }

    async fn runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<JobRun>> {
        Ok(self.read(|state| {
            state
                .runs
                .values()
                .filter(|r| statuses.contains(&r.status))
                .cloned()
                .collect()
        }))
    }

    async fn delete_run(&self, id: RunId) -> Result<()> {
        self.mutate(|state| {
            state.runs.remove(&id);
            Ok(())
        })
        .await
    }

    async fn delete_finished_runs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.mutate(|state| {
            let before = state.runs.len();
            state.runs.retain(|_, run| {
                !(run.status.is_terminal() && run.finished_at.is_some_and(|at| at < cutoff))
            });
            Ok(before - state.runs.len())
        })
        .await
    }
}

#[async_trait]
impl SignalCatalog for MemoryLedger {
    async fn signal_set_by_cid(&self, cid: &str) -> Result<Option<SignalSet>> {
        Ok(self.read(|state| {
            state
                .signal_sets
                .values()
                .find(|s| s.cid == cid)
                .cloned()
        }))
    }

    async fn signal_in_set(&self, set: SignalSetId, cid: &str) -> Result<Option<Signal>> {
        Ok(self.read(|state| {
            state
                .signals
                .values()
                .find(|s| s.set == set && s.cid == cid)
                .cloned()
        }))
    }

    async fn create_signal_set(
        &self,
        owner: JobId,
        new_set: NewSignalSet,
    ) -> Result<CreatedSignalSet> {
        self.mutate(|state| {
            if state.signal_sets.values().any(|s| s.cid == new_set.cid) {
                return Err(JobvisorError::Ledger(format!(
                    "signal set with cid {} already exists",
                    new_set.cid
                )));
            }

            for (i, new_signal) in new_set.signals.iter().enumerate() {
                if new_set.signals[..i].iter().any(|s| s.cid == new_signal.cid) {
                    return Err(JobvisorError::Ledger(format!(
                        "duplicate signal cid {} in set {}",
                        new_signal.cid, new_set.cid
                    )));
                }
            }

            let set = SignalSet {
                id: state.next_id(),
                cid: new_set.cid,
                namespace: new_set.namespace,
                computed: true,
            };
            state.signal_sets.insert(set.id, set.clone());

            let mut signals = Vec::with_capacity(new_set.signals.len());
            for new_signal in new_set.signals {
                let signal = Signal {
                    id: state.next_id(),
                    set: set.id,
                    cid: new_signal.cid,
                    namespace: set.namespace,
                };
                state.signals.insert(signal.id, signal.clone());
                signals.push(signal);
            }

            state.set_owners.push((owner, set.id));
            Ok(CreatedSignalSet { set, signals })
        })
        .await
    }

    async fn delete_sets_owned_by(&self, owner: JobId) -> Result<Vec<SignalSetId>> {
        self.mutate(|state| {
            let owned: Vec<SignalSetId> = state
                .set_owners
                .iter()
                .filter(|(job, _)| *job == owner)
                .map(|(_, set)| *set)
                .collect();

            state.set_owners.retain(|(job, _)| *job != owner);
            state.signals.retain(|_, signal| !owned.contains(&signal.set));
            for set in &owned {
                state.signal_sets.remove(set);
            }
            for job in state.jobs.values_mut() {
                job.signal_set_triggers.retain(|set| !owned.contains(set));
            }
            Ok(owned)
        })
        .await
    }
}
