// src/trigger/signal.rs

use tracing::warn;

use crate::errors::Result;
use crate::ledger::{Ledger, SignalCatalog};
use crate::types::Job;

/// Enabled jobs triggered by the signal set `cid`.
pub async fn jobs_for_source(
    ledger: &dyn Ledger,
    catalog: &dyn SignalCatalog,
    cid: &str,
) -> Result<Vec<Job>> {
    let Some(set) = catalog.signal_set_by_cid(cid).await? else {
        warn!(cid, "signal trigger for unknown signal set");
        return Ok(Vec::new());
    };

    let jobs = ledger.jobs_triggered_by(set.id).await?;
    Ok(jobs.into_iter().filter(Job::is_enabled).collect())
}
