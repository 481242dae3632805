// src/engine/entities.rs

//! Resolution of entity-reference parameters into index and field names.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{JobvisorError, Result};
use crate::ledger::SignalCatalog;
use crate::types::{ParamKind, ParamSpec};

/// Signal sets and signals referenced by a job's params, keyed by cid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entities {
    pub signal_sets: BTreeMap<String, SetEntity>,
    pub signals: BTreeMap<String, SignalEntity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetEntity {
    pub index: String,
    pub namespace: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEntity {
    pub field: String,
    pub namespace: u64,
}

/// Resolve every `signalSet` / `signal` parameter of `schema` against the
/// catalog. Other parameter kinds are passed to the job untouched and are
/// ignored here.
pub async fn resolve_entities(
    catalog: &dyn SignalCatalog,
    params: &Value,
    schema: &[ParamSpec],
) -> Result<Entities> {
    let mut entities = Entities::default();

    for param in schema {
        match param.kind {
            ParamKind::SignalSet => {
                let cid = param_str(params, &param.id).ok_or_else(|| {
                    resolution_error(format!("Job doesn't specify parameter {}.", param.id))
                })?;

                let set = catalog
                    .signal_set_by_cid(cid)
                    .await?
                    .ok_or_else(|| resolution_error(format!("Set with cid {cid} not found.")))?;

                entities.signal_sets.insert(
                    cid.to_string(),
                    SetEntity {
                        index: set.index_name(),
                        namespace: set.namespace,
                    },
                );
            }

            ParamKind::Signal => {
                let set_cid = match param.signal_set_ref {
                    Some(ref sibling) => param_str(params, sibling),
                    None => param.signal_set.as_deref().filter(|s| !s.is_empty()),
                }
                .ok_or_else(|| {
                    resolution_error(format!(
                        "Signal set's cid for parameter {} not specified.",
                        param.id
                    ))
                })?;

                let signal_cid = param_str(params, &param.id).ok_or_else(|| {
                    resolution_error(format!(
                        "Signal's cid for parameter {} not specified.",
                        param.id
                    ))
                })?;

                let set = catalog.signal_set_by_cid(set_cid).await?.ok_or_else(|| {
                    resolution_error(format!("Signal set with cid {set_cid} not found."))
                })?;

                let signal = catalog
                    .signal_in_set(set.id, signal_cid)
                    .await?
                    .ok_or_else(|| {
                        resolution_error(format!(
                            "Signal with cid {signal_cid} in set {} not found.",
                            set.id
                        ))
                    })?;

                entities.signals.insert(
                    signal_cid.to_string(),
                    SignalEntity {
                        field: signal.field_name(),
                        namespace: signal.namespace,
                    },
                );
            }

            ParamKind::Other => {}
        }
    }

    Ok(entities)
}

fn param_str<'a>(params: &'a Value, id: &str) -> Option<&'a str> {
    params
        .get(id)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn resolution_error(msg: String) -> JobvisorError {
    JobvisorError::EntityResolution(msg)
}
