// src/recovery.rs

//! Startup reconciliation of rows left in transient states by an unclean
//! shutdown. Must run before the worker accepts messages.

use tracing::{error, info};

use crate::clock::Clock;
use crate::errors::Result;
use crate::ledger::Ledger;
use crate::types::{BuildOutput, BuildState, RunStatus, RunUpdate};

pub const CANCELLED_UPON_START: &str = "Cancelled upon start";

/// What [`recover`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub runs_failed: usize,
    pub tasks_reset: usize,
}

/// Fail every non-terminal run and reset every task stuck mid-build.
///
/// Interrupted inits go back to `Uninitialized`, other builds to `Failed`.
/// A row that cannot be updated is logged and skipped.
pub async fn recover(ledger: &dyn Ledger, clock: &dyn Clock) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let now = clock.now();

    for run in ledger.runs_with_status(&RunStatus::ACTIVE).await? {
        let update = RunUpdate::status(RunStatus::Failed)
            .with_output(CANCELLED_UPON_START)
            .finished_at(now);
        match ledger.update_run(run.id, update).await {
            Ok(()) => report.runs_failed += 1,
            Err(err) => error!(run_id = run.id, error = %err, "failed to clear run"),
        }
    }

    for task in ledger.tasks_in_build_states(&BuildState::TRANSIENT).await? {
        let state = match task.build_state {
            BuildState::Initializing => BuildState::Uninitialized,
            _ => BuildState::Failed,
        };
        let output = BuildOutput::errors(vec![CANCELLED_UPON_START.to_string()]);
        match ledger.set_build_state(task.id, state, Some(output)).await {
            Ok(()) => report.tasks_reset += 1,
            Err(err) => error!(task_id = task.id, error = %err, "failed to clear build"),
        }
    }

    info!(
        runs_failed = report.runs_failed,
        tasks_reset = report.tasks_reset,
        "recovery finished"
    );
    Ok(report)
}
