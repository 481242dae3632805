// src/types.rs

//! Domain records shared by the ledger, the engine and the handlers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type TaskId = u64;
pub type JobId = u64;
pub type RunId = u64;
pub type SignalSetId = u64;
pub type SignalId = u64;

/// Discriminates which type handler builds and runs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Python,
    Numpy,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Python => "python",
            TaskType::Numpy => "numpy",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" => Ok(TaskType::Python),
            "numpy" => Ok(TaskType::Numpy),
            other => Err(format!(
                "unknown task type: {other} (expected \"python\" or \"numpy\")"
            )),
        }
    }
}

/// Build state of a task.
///
/// ```text
/// Uninitialized -> Initializing -> Finished | Uninitialized
/// Scheduled -> Processing -> Finished | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Scheduled,
    Processing,
    Finished,
    Failed,
    #[default]
    Uninitialized,
    Initializing,
}

impl BuildState {
    /// States a build passes through while work is still pending.
    pub const TRANSIENT: [BuildState; 3] = [
        BuildState::Initializing,
        BuildState::Processing,
        BuildState::Scheduled,
    ];

    pub fn is_transient(self) -> bool {
        Self::TRANSIENT.contains(&self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Disabled,
    Enabled,
    InvalidParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Scheduled,
    Running,
    Initialization,
}

impl RunStatus {
    /// Statuses of a run that has not reached a terminal state yet.
    pub const ACTIVE: [RunStatus; 3] = [
        RunStatus::Initialization,
        RunStatus::Scheduled,
        RunStatus::Running,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

/// Warnings and errors produced by the last build of a task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildOutput {
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl BuildOutput {
    pub fn new(warnings: Vec<String>, errors: Vec<String>) -> Self {
        Self { warnings, errors }
    }

    pub fn errors(errors: Vec<String>) -> Self {
        Self {
            warnings: Vec::new(),
            errors,
        }
    }
}

/// Kind of a task parameter. Only entity references matter to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamKind {
    SignalSet,
    Signal,
    #[serde(other)]
    Other,
}

/// One entry of a task's parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    /// For `signal` params: id of the sibling param holding the set cid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_set_ref: Option<String>,
    /// For `signal` params: fixed set cid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_set: Option<String>,
}

/// Opaque task settings. The engine only looks at the code and the schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskSettings {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub settings: TaskSettings,
    pub build_state: BuildState,
    #[serde(default)]
    pub build_output: Option<BuildOutput>,
    /// An init has succeeded since the task was created or its last init
    /// failed. Until then every build request is carried out as an init.
    #[serde(default)]
    pub initialized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub task: TaskId,
    /// Parameter bag, opaque except for entity references.
    #[serde(default)]
    pub params: Value,
    pub state: JobState,
    /// Time trigger in seconds.
    #[serde(default)]
    pub trigger: Option<u64>,
    /// Minimal gap between two runs in seconds.
    #[serde(default)]
    pub min_gap: Option<u64>,
    /// Start delay in seconds.
    #[serde(default)]
    pub delay: Option<u64>,
    #[serde(default)]
    pub signal_set_triggers: Vec<SignalSetId>,
}

impl Job {
    pub fn trigger_interval(&self) -> Option<Duration> {
        positive_secs(self.trigger)
    }

    pub fn min_gap(&self) -> Option<Duration> {
        positive_secs(self.min_gap)
    }

    pub fn delay(&self) -> Option<Duration> {
        positive_secs(self.delay)
    }

    pub fn is_enabled(&self) -> bool {
        self.state == JobState::Enabled
    }
}

fn positive_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: RunId,
    pub job: JobId,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: String,
}

/// Partial update of a run row. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub output: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn apply(&self, run: &mut JobRun) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(ref output) = self.output {
            run.output = output.clone();
        }
        if let Some(at) = self.started_at {
            run.started_at = Some(at);
        }
        if let Some(at) = self.finished_at {
            run.finished_at = Some(at);
        }
    }
}

/// Signal set as known to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSet {
    pub id: SignalSetId,
    pub cid: String,
    pub namespace: u64,
    #[serde(default)]
    pub computed: bool,
}

impl SignalSet {
    /// Name of the search index holding the set's records.
    pub fn index_name(&self) -> String {
        format!("signal_set_{}", self.cid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub set: SignalSetId,
    pub cid: String,
    pub namespace: u64,
}

impl Signal {
    /// Name of the field holding the signal inside its set's index.
    pub fn field_name(&self) -> String {
        format!("s{}", self.id)
    }
}
