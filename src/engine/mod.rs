// src/engine/mod.rs

//! Orchestration engine for jobvisor.
//!
//! This module ties together:
//! - the work queue drained by the dispatch loop
//! - the run tracker (single-flight guard, delay and gap timers, build waits,
//!   executing runs)
//! - the build coordinator driving the task build state machine
//! - the run coordinator admitting, dispatching and finalizing job runs
//!
//! All of it is owned by a single [`Worker`] task. Other components talk to
//! it through a [`WorkerHandle`]; type handler futures and timers report back
//! through the same event channel, so admission decisions never race.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::clock::Clock;
use crate::errors::{JobvisorError, Result};
use crate::handler::{BuildOutcome, HandlerRegistry, RunOutcome};
use crate::ledger::{Ledger, SignalCatalog};
use crate::snapshot::SnapshotStore;
use crate::types::{JobId, RunId, TaskId, TaskType};

pub mod build;
pub mod entities;
pub mod queue;
pub mod requests;
pub mod run;
pub mod tracker;
pub mod worker;

pub use entities::Entities;
pub use queue::{BuildKind, PreparedRun, WorkEntry, WorkQueue};
pub use requests::RequestHandle;
pub use tracker::{RunTracker, TrackerView};
pub use worker::Worker;

/// Output printed on runs cancelled through a stop request.
pub const RUN_CANCELLED: &str = "Run cancelled.";

/// Messages accepted by the worker.
///
/// On the wire they are `{"type": "RUN", "spec": {...}}` objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerMsg {
    #[serde(rename_all = "camelCase")]
    Build {
        task_id: TaskId,
        code: String,
        dest_dir: PathBuf,
    },
    #[serde(rename_all = "camelCase")]
    Init {
        task_id: TaskId,
        code: String,
        dest_dir: PathBuf,
    },
    /// `run_id` absent means the worker creates the run record itself.
    #[serde(rename_all = "camelCase")]
    Run {
        job_id: JobId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
        task_dir: PathBuf,
    },
    #[serde(rename_all = "camelCase")]
    Stop { job_id: JobId, run_id: RunId },
    #[serde(rename_all = "camelCase")]
    DeleteTask { task_id: TaskId, task_type: TaskType },
    #[serde(rename_all = "camelCase")]
    DeleteJob { job_id: JobId },
    /// A signal set (identified by cid) received new data.
    #[serde(rename_all = "camelCase")]
    SignalTrigger { source_id: String },
}

/// Events flowing into the worker from the front, timers and handlers.
#[derive(Debug)]
pub enum WorkerEvent {
    Message(HandlerMsg),
    BuildFinished {
        task_id: TaskId,
        kind: BuildKind,
        generation: u64,
        outcome: BuildOutcome,
    },
    RunFinished {
        job_id: JobId,
        run_id: RunId,
        outcome: RunOutcome,
    },
    DelayElapsed {
        job_id: JobId,
        token: u64,
    },
    GapElapsed {
        job_id: JobId,
        token: u64,
    },
    /// Report the in-memory tracking state (diagnostics and tests).
    Inspect(oneshot::Sender<TrackerView>),
    /// Graceful shutdown requested (e.g. Ctrl-C).
    Shutdown,
}

/// Collaborators the worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub ledger: Arc<dyn Ledger>,
    pub catalog: Arc<dyn SignalCatalog>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub handlers: HandlerRegistry,
    pub clock: Arc<dyn Clock>,
    /// Root directory of task content, used for runs started by triggers.
    pub content_dir: PathBuf,
}

/// Cheap cloneable sender side of the worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerEvent>,
}

impl WorkerHandle {
    pub(crate) fn new(tx: mpsc::Sender<WorkerEvent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, msg: HandlerMsg) -> Result<()> {
        self.tx.send(WorkerEvent::Message(msg)).await?;
        Ok(())
    }

    pub async fn inspect(&self) -> Result<TrackerView> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(WorkerEvent::Inspect(reply_tx)).await?;
        reply_rx.await.map_err(|_| JobvisorError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(WorkerEvent::Shutdown).await?;
        Ok(())
    }
}
