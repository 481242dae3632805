#![allow(dead_code)]

use serde_json::{json, Value};

use jobvisor::ledger::{NewJob, NewTask};
use jobvisor::types::{
    BuildState, JobState, ParamKind, ParamSpec, SignalSetId, TaskId, TaskSettings, TaskType,
};

/// Builder for `NewTask`. Defaults to a built Python task without params.
pub struct TaskBuilder {
    task: NewTask,
}

impl TaskBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            task: NewTask {
                name: name.to_string(),
                task_type: TaskType::Python,
                settings: TaskSettings {
                    code: "print('hello')".to_string(),
                    params: Vec::new(),
                },
                build_state: BuildState::Finished,
                initialized: true,
            },
        }
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task.task_type = task_type;
        self
    }

    pub fn code(mut self, code: &str) -> Self {
        self.task.settings.code = code.to_string();
        self
    }

    /// Also marks the task uninitialized when `state` is `Uninitialized`.
    pub fn build_state(mut self, state: BuildState) -> Self {
        self.task.build_state = state;
        self.task.initialized = state != BuildState::Uninitialized;
        self
    }

    pub fn initialized(mut self, initialized: bool) -> Self {
        self.task.initialized = initialized;
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.task.settings.params.push(param);
        self
    }

    pub fn signal_set_param(self, id: &str) -> Self {
        self.param(ParamSpec {
            id: id.to_string(),
            kind: ParamKind::SignalSet,
            signal_set_ref: None,
            signal_set: None,
        })
    }

    /// `signal` param whose set cid is taken from the sibling param `set_ref`.
    pub fn signal_param(self, id: &str, set_ref: &str) -> Self {
        self.param(ParamSpec {
            id: id.to_string(),
            kind: ParamKind::Signal,
            signal_set_ref: Some(set_ref.to_string()),
            signal_set: None,
        })
    }

    pub fn build(self) -> NewTask {
        self.task
    }
}

/// Builder for `NewJob`. Defaults to an enabled job with empty params and
/// no triggers, gap or delay.
pub struct JobBuilder {
    job: NewJob,
}

impl JobBuilder {
    pub fn new(task: TaskId) -> Self {
        Self {
            job: NewJob {
                name: "job".to_string(),
                task,
                params: json!({}),
                state: JobState::Enabled,
                trigger: None,
                min_gap: None,
                delay: None,
                signal_set_triggers: Vec::new(),
            },
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.job.name = name.to_string();
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.job.params = params;
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.job.state = state;
        self
    }

    pub fn trigger(mut self, secs: u64) -> Self {
        self.job.trigger = Some(secs);
        self
    }

    pub fn min_gap(mut self, secs: u64) -> Self {
        self.job.min_gap = Some(secs);
        self
    }

    pub fn delay(mut self, secs: u64) -> Self {
        self.job.delay = Some(secs);
        self
    }

    pub fn triggered_by(mut self, set: SignalSetId) -> Self {
        self.job.signal_set_triggers.push(set);
        self
    }

    pub fn build(self) -> NewJob {
        self.job
    }
}
