// tests/job_requests.rs

use std::error::Error;
use std::sync::Arc;

use serde_json::{Value, json};

use jobvisor::engine::RequestHandle;
use jobvisor::engine::entities::resolve_entities;
use jobvisor::handler::RunOutcome;
use jobvisor::ledger::{MemoryLedger, SignalCatalog};
use jobvisor::snapshot::{MemorySnapshotStore, SnapshotStore};
use jobvisor::types::{ParamKind, ParamSpec, RunStatus};
use jobvisor_test_utils::{FakeHandler, Harness};

type TestResult = Result<(), Box<dyn Error>>;

fn handle(job: u64) -> (RequestHandle, Arc<MemoryLedger>, Arc<MemorySnapshotStore>) {
    let ledger = Arc::new(MemoryLedger::new());
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let handle = RequestHandle::new(job, ledger.clone(), snapshots.clone());
    (handle, ledger, snapshots)
}

fn error_of(response: &Value) -> Option<&str> {
    response.get("error").and_then(Value::as_str)
}

#[tokio::test]
async fn unparseable_request_reports_error() -> TestResult {
    let (requests, _, _) = handle(1);

    let response = requests.request("{not json").await;
    let error = error_of(&response).ok_or("missing error")?;
    assert!(error.starts_with("Request parsing failed:"), "{error}");
    Ok(())
}

#[tokio::test]
async fn unknown_request_type_answers_empty_object() -> TestResult {
    let (requests, _, _) = handle(1);

    assert_eq!(requests.request(r#"{"type":"ping"}"#).await, json!({}));
    assert_eq!(requests.request(r#"{"no":"type"}"#).await, json!({}));
    Ok(())
}

#[tokio::test]
async fn sets_request_creates_owned_signal_set() -> TestResult {
    let (requests, ledger, _) = handle(9);

    let response = requests
        .request(
            r#"{"type":"sets","sigSet":{"cid":"hourly","namespace":4,
                "signals":[{"cid":"mean","type":"double"},{"cid":"max"}]}}"#,
        )
        .await;

    let set = ledger
        .signal_set_by_cid("hourly")
        .await?
        .ok_or("set not created")?;
    assert!(set.computed);
    assert_eq!(set.namespace, 4);

    let mean = ledger.signal_in_set(set.id, "mean").await?.ok_or("mean")?;
    let max = ledger.signal_in_set(set.id, "max").await?.ok_or("max")?;
    assert_eq!(
        response,
        json!({
            "index": "signal_set_hourly",
            "type": "_doc",
            "fields": { "mean": mean.field_name(), "max": max.field_name() },
        })
    );

    // The job owns the set.
    assert_eq!(ledger.delete_sets_owned_by(9).await?, vec![set.id]);
    Ok(())
}

#[tokio::test]
async fn duplicate_or_invalid_sets_report_errors() -> TestResult {
    let (requests, ledger, _) = handle(1);
    ledger.insert_signal_set("taken", 0).await?;

    let response = requests
        .request(r#"{"type":"sets","sigSet":{"cid":"taken","signals":[]}}"#)
        .await;
    assert!(error_of(&response).is_some_and(|e| e.contains("already exists")));

    let response = requests
        .request(r#"{"type":"sets","sigSet":{"cid":"dup","signals":[{"cid":"a"},{"cid":"a"}]}}"#)
        .await;
    assert!(error_of(&response).is_some_and(|e| e.contains("duplicate signal cid a")));
    // All or nothing.
    assert!(ledger.signal_set_by_cid("dup").await?.is_none());

    let response = requests
        .request(r#"{"type":"sets","sigSet":{"signals":[]}}"#)
        .await;
    assert!(error_of(&response).is_some_and(|e| e.starts_with("Invalid signal set:")));
    Ok(())
}

#[tokio::test]
async fn store_request_persists_job_state() -> TestResult {
    let (requests, _, snapshots) = handle(3);

    let response = requests
        .request(r#"{"type":"store","state":{"cursor":"2024-01-01"}}"#)
        .await;
    assert_eq!(response, json!({}));
    assert_eq!(snapshots.load(3).await?, Some(json!({ "cursor": "2024-01-01" })));

    // Older jobs send the state under `config`.
    requests
        .request(r#"{"type":"store","config":{"cursor":"2024-02-01"}}"#)
        .await;
    assert_eq!(snapshots.load(3).await?, Some(json!({ "cursor": "2024-02-01" })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn running_job_can_store_state_through_its_context() -> TestResult {
    let h = Harness::with_handler(FakeHandler::new().manual_runs());
    let (_task, job) = h.add_task_and_job(|j| j).await;

    h.request_run(job).await;
    let calls = h.handler.wait_for_runs(1).await;
    let ctx = &calls.runs[0];
    assert_eq!(ctx.requests.job(), job);

    let response = ctx
        .requests
        .request(r#"{"type":"store","state":{"seen":10}}"#)
        .await;
    assert_eq!(response, json!({}));

    h.handler.finish_run(
        ctx.run_id,
        RunOutcome::Success {
            output: String::new(),
            new_state: None,
        },
    );
    h.wait_for_run_status(ctx.run_id, RunStatus::Success).await;

    // A success without a new state keeps the stored one.
    assert_eq!(h.snapshots.load(job).await?, Some(json!({ "seen": 10 })));

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn signal_param_with_fixed_set_resolves() -> TestResult {
    let ledger = MemoryLedger::new();
    let set = ledger.insert_signal_set("plant", 2).await?;
    let signal = ledger.insert_signal(set.id, "temp").await?;

    let schema = vec![
        ParamSpec {
            id: "sensor".to_string(),
            kind: ParamKind::Signal,
            signal_set_ref: None,
            signal_set: Some("plant".to_string()),
        },
        ParamSpec {
            id: "label".to_string(),
            kind: ParamKind::Other,
            signal_set_ref: None,
            signal_set: None,
        },
    ];
    let params = json!({ "sensor": "temp", "label": "x" });

    let entities = resolve_entities(&ledger, &params, &schema).await?;
    assert!(entities.signal_sets.is_empty());
    assert_eq!(entities.signals["temp"].field, signal.field_name());
    assert_eq!(entities.signals["temp"].namespace, 2);
    Ok(())
}

#[tokio::test]
async fn signal_param_errors_name_the_missing_piece() -> TestResult {
    let ledger = MemoryLedger::new();
    let set = ledger.insert_signal_set("plant", 0).await?;

    let schema = vec![ParamSpec {
        id: "sensor".to_string(),
        kind: ParamKind::Signal,
        signal_set_ref: Some("source".to_string()),
        signal_set: None,
    }];

    let cases = [
        (json!({ "sensor": "temp" }), "Signal set's cid for parameter sensor not specified.".to_string()),
        (json!({ "source": "plant" }), "Signal's cid for parameter sensor not specified.".to_string()),
        (
            json!({ "source": "nowhere", "sensor": "temp" }),
            "Signal set with cid nowhere not found.".to_string(),
        ),
        (
            json!({ "source": "plant", "sensor": "temp" }),
            format!("Signal with cid temp in set {} not found.", set.id),
        ),
    ];

    for (params, expected) in cases {
        let err = resolve_entities(&ledger, &params, &schema)
            .await
            .expect_err("resolution must fail");
        assert_eq!(err.to_string(), expected);
    }
    Ok(())
}
