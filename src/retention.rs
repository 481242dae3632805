// src/retention.rs

//! Pruning of old finished runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::errors::Result;
use crate::ledger::Ledger;

const MAX_PRUNE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Delete finished runs older than `retention`. Returns how many were removed.
pub async fn prune_once(ledger: &dyn Ledger, clock: &dyn Clock, retention: Duration) -> Result<usize> {
    let window = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let cutoff = clock
        .now()
        .checked_sub_signed(window)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

    let removed = ledger.delete_finished_runs_before(cutoff).await?;
    if removed > 0 {
        info!(removed, %cutoff, "pruned old runs");
    } else {
        debug!(%cutoff, "no runs to prune");
    }
    Ok(removed)
}

/// Prune once now and then every `retention` (at most once a day).
pub fn spawn_retention(
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    retention: Duration,
) -> JoinHandle<()> {
    let period = retention.clamp(Duration::from_secs(1), MAX_PRUNE_PERIOD);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(err) = prune_once(ledger.as_ref(), clock.as_ref(), retention).await {
                error!(error = %err, "run log pruning failed");
            }
        }
    })
}
