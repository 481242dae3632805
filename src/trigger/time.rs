// src/trigger/time.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, elapsed_since};
use crate::engine::{HandlerMsg, WorkerHandle};
use crate::errors::{JobvisorError, Result};
use crate::ledger::Ledger;
use crate::paths::task_build_output_dir;
use crate::types::{Job, JobState};

/// Enabled jobs whose trigger interval has passed since their last
/// successful run. Jobs that never succeeded are always due.
pub async fn due_jobs(ledger: &dyn Ledger, now: DateTime<Utc>) -> Result<Vec<Job>> {
    let mut due = Vec::new();

    for job in ledger.jobs_by_state(JobState::Enabled).await? {
        let Some(interval) = job.trigger_interval() else {
            continue;
        };

        match ledger.last_successful_run(job.id).await {
            Ok(Some(last)) => match last.started_at {
                Some(started) if elapsed_since(now, started) <= interval => {}
                _ => due.push(job),
            },
            Ok(None) => due.push(job),
            Err(err) => warn!(job_id = job.id, error = %err, "skipping job in time trigger scan"),
        }
    }

    Ok(due)
}

/// Run one scan and request a run of every due job. Returns how many runs
/// were requested.
pub async fn scan_once(
    ledger: &dyn Ledger,
    clock: &dyn Clock,
    handle: &WorkerHandle,
    content_dir: &Path,
) -> Result<usize> {
    let due = due_jobs(ledger, clock.now()).await?;
    let count = due.len();

    for job in due {
        debug!(job_id = job.id, "time trigger due");
        handle
            .send(HandlerMsg::Run {
                job_id: job.id,
                run_id: None,
                task_dir: task_build_output_dir(content_dir, job.task),
            })
            .await?;
    }

    Ok(count)
}

/// Spawn the periodic time-trigger scan. The first scan happens one
/// `interval` after start.
pub fn spawn_time_trigger(
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    handle: WorkerHandle,
    content_dir: PathBuf,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "time trigger started");

        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match scan_once(ledger.as_ref(), clock.as_ref(), &handle, &content_dir).await {
                Ok(0) => {}
                Ok(count) => debug!(count, "time trigger requested runs"),
                Err(JobvisorError::ChannelClosed) => {
                    info!("worker gone; stopping time trigger");
                    break;
                }
                Err(err) => error!(error = %err, "time trigger scan failed"),
            }
        }
    })
}
