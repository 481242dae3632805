// src/engine/requests.rs

//! Structured requests a running job sends back to the engine.
//!
//! ```text
//! {"type":"sets","sigSet":{"cid":..,"namespace":..,"signals":[..]}}
//!     -> {"index":..,"type":"_doc","fields":{<signal cid>: <field>}}
//! {"type":"store","state":{..}}
//!     -> {}
//! ```
//!
//! Failures are reported in an `error` field of the response; they never
//! affect the status of the run.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::ledger::{NewSignalSet, SignalCatalog};
use crate::snapshot::SnapshotStore;
use crate::types::JobId;

const CREATE_SIGNALS: &str = "sets";
const STORE_STATE: &str = "store";

/// Per-run endpoint for job requests, handed to the type handler.
#[derive(Clone)]
pub struct RequestHandle {
    job: JobId,
    catalog: Arc<dyn SignalCatalog>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

impl RequestHandle {
    pub fn new(
        job: JobId,
        catalog: Arc<dyn SignalCatalog>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            job,
            catalog,
            snapshots,
        }
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    /// Process one raw JSON request and produce the JSON response.
    pub async fn request(&self, raw: &str) -> Value {
        let req: Value = match serde_json::from_str(raw) {
            Ok(req) => req,
            Err(err) => return error_response(format!("Request parsing failed: {err}")),
        };

        match req.get("type").and_then(Value::as_str) {
            Some(CREATE_SIGNALS) => match req.get("sigSet") {
                Some(set) => self.create_signal_set(set.clone()).await,
                None => empty_response(),
            },
            Some(STORE_STATE) => {
                // Older jobs send the state under `config`.
                match req.get("state").or_else(|| req.get("config")) {
                    Some(state) => self.store_state(state.clone()).await,
                    None => empty_response(),
                }
            }
            other => {
                debug!(job_id = self.job, request_type = ?other, "ignoring unknown job request");
                empty_response()
            }
        }
    }

    async fn create_signal_set(&self, set: Value) -> Value {
        let new_set: NewSignalSet = match serde_json::from_value(set) {
            Ok(set) => set,
            Err(err) => return error_response(format!("Invalid signal set: {err}")),
        };

        match self.catalog.create_signal_set(self.job, new_set).await {
            Ok(created) => {
                let fields: Map<String, Value> = created
                    .signals
                    .iter()
                    .map(|s| (s.cid.clone(), Value::String(s.field_name())))
                    .collect();
                json!({
                    "index": created.set.index_name(),
                    "type": "_doc",
                    "fields": fields,
                })
            }
            Err(err) => {
                warn!(job_id = self.job, error = %err, "signal set creation failed");
                error_response(err.to_string())
            }
        }
    }

    async fn store_state(&self, state: Value) -> Value {
        match self.snapshots.store(self.job, state).await {
            Ok(()) => empty_response(),
            Err(err) => {
                warn!(job_id = self.job, error = %err, "storing job state failed");
                error_response(err.to_string())
            }
        }
    }
}

fn empty_response() -> Value {
    Value::Object(Map::new())
}

fn error_response(msg: String) -> Value {
    json!({ "error": msg })
}
