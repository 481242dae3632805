// tests/storage.rs

use std::error::Error;
use std::fs;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tempfile::tempdir;

use jobvisor::errors::JobvisorError;
use jobvisor::ledger::{Ledger, MemoryLedger, NewSignal, NewSignalSet, SignalCatalog};
use jobvisor::snapshot::{FileSnapshotStore, SnapshotStore};
use jobvisor::types::{BuildOutput, BuildState, RunStatus, RunUpdate};
use jobvisor_test_utils::{JobBuilder, TaskBuilder};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn file_ledger_survives_reopen() -> TestResult {
    let dir = tempdir()?;
    let path = dir.path().join("state").join("ledger.json");

    let (task, job, run) = {
        let ledger = MemoryLedger::open(&path)?;
        let task = ledger.insert_task(TaskBuilder::new("persisted").build()).await?;
        ledger
            .set_build_state(
                task,
                BuildState::Failed,
                Some(BuildOutput::errors(vec!["boom".to_string()])),
            )
            .await?;
        let job = ledger.insert_job(JobBuilder::new(task).min_gap(5).build()).await?;
        let run = ledger.create_run(job, RunStatus::Running, Utc::now()).await?;
        ledger
            .update_run(run, RunUpdate::status(RunStatus::Success).with_output("42"))
            .await?;
        ledger
            .create_signal_set(
                job,
                NewSignalSet {
                    cid: "out".to_string(),
                    name: None,
                    namespace: 0,
                    signals: Vec::new(),
                },
            )
            .await?;
        (task, job, run)
    };

    assert!(path.exists());
    assert!(!path.with_extension("json.tmp").exists());

    let reopened = MemoryLedger::open(&path)?;
    let stored_task = reopened.get_task(task).await?.ok_or("task missing")?;
    assert_eq!(stored_task.name, "persisted");
    assert_eq!(stored_task.build_state, BuildState::Failed);
    assert_eq!(
        stored_task.build_output.map(|o| o.errors),
        Some(vec!["boom".to_string()])
    );

    let stored_job = reopened.get_job(job).await?.ok_or("job missing")?;
    assert_eq!(stored_job.min_gap, Some(5));

    let stored_run = reopened.get_run(run).await?.ok_or("run missing")?;
    assert_eq!(stored_run.status, RunStatus::Success);
    assert_eq!(stored_run.output, "42");

    // Ownership is persisted too.
    let owned = reopened.delete_sets_owned_by(job).await?;
    assert_eq!(owned.len(), 1);

    // Ids keep increasing after a reopen.
    let next = reopened.insert_task(TaskBuilder::new("next").build()).await?;
    assert!(next > run);
    Ok(())
}

#[test]
fn corrupt_ledger_file_is_rejected() -> TestResult {
    let dir = tempdir()?;
    let path = dir.path().join("ledger.json");
    fs::write(&path, "{ not json")?;

    assert!(matches!(
        MemoryLedger::open(&path),
        Err(JobvisorError::Ledger(_))
    ));

    // Empty files are treated as an empty ledger.
    fs::write(&path, "")?;
    MemoryLedger::open(&path)?;
    Ok(())
}

#[tokio::test]
async fn failed_mutation_leaves_state_untouched() -> TestResult {
    let ledger = MemoryLedger::new();

    let err = ledger
        .insert_job(JobBuilder::new(99).build())
        .await
        .expect_err("task 99 does not exist");
    assert!(matches!(err, JobvisorError::TaskNotFound(99)));

    assert!(ledger.list_tasks().await?.is_empty());
    assert!(ledger.jobs_of_task(99).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn rejected_signal_set_is_not_half_created() -> TestResult {
    let dir = tempdir()?;
    let path = dir.path().join("ledger.json");
    let ledger = MemoryLedger::open(&path)?;
    let task = ledger.insert_task(TaskBuilder::new("t").build()).await?;
    let job = ledger.insert_job(JobBuilder::new(task).build()).await?;

    let signal = |cid: &str| NewSignal {
        cid: cid.to_string(),
        name: None,
        kind: None,
    };
    let err = ledger
        .create_signal_set(
            job,
            NewSignalSet {
                cid: "dup".to_string(),
                name: None,
                namespace: 0,
                signals: vec![signal("a"), signal("b"), signal("a")],
            },
        )
        .await
        .expect_err("duplicate signal cid");
    assert!(err.to_string().contains("duplicate signal cid a"));

    assert!(ledger.signal_set_by_cid("dup").await?.is_none());
    assert!(ledger.delete_sets_owned_by(job).await?.is_empty());

    let reopened = MemoryLedger::open(&path)?;
    assert!(reopened.signal_set_by_cid("dup").await?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_all_reach_the_file() -> TestResult {
    let dir = tempdir()?;
    let path = dir.path().join("ledger.json");
    let ledger = Arc::new(MemoryLedger::open(&path)?);
    let task = ledger.insert_task(TaskBuilder::new("t").build()).await?;
    let job = ledger.insert_job(JobBuilder::new(task).build()).await?;

    let mut writers = Vec::new();
    for i in 0..20 {
        let ledger = Arc::clone(&ledger);
        writers.push(tokio::spawn(async move {
            let run = ledger.create_run(job, RunStatus::Running, Utc::now()).await?;
            ledger
                .update_run(
                    run,
                    RunUpdate::status(RunStatus::Success).with_output(format!("run {i}")),
                )
                .await?;
            Ok::<_, JobvisorError>(run)
        }));
    }
    let mut runs = Vec::new();
    for writer in writers {
        runs.push(writer.await??);
    }

    let reopened = MemoryLedger::open(&path)?;
    let stored = reopened.runs_with_status(&[RunStatus::Success]).await?;
    assert_eq!(stored.len(), 20);
    for run in runs {
        let stored = reopened.get_run(run).await?.ok_or("run missing")?;
        assert_eq!(stored.status, RunStatus::Success);
    }
    Ok(())
}

#[tokio::test]
async fn last_successful_run_is_latest_by_start() -> TestResult {
    let ledger = MemoryLedger::new();
    let task = ledger.insert_task(TaskBuilder::new("t").build()).await?;
    let job = ledger.insert_job(JobBuilder::new(task).build()).await?;

    let now = Utc::now();
    let older = ledger
        .create_run(job, RunStatus::Success, now - chrono::Duration::minutes(10))
        .await?;
    let newer = ledger
        .create_run(job, RunStatus::Success, now - chrono::Duration::minutes(1))
        .await?;
    ledger.create_run(job, RunStatus::Failed, now).await?;

    let last = ledger.last_successful_run(job).await?.ok_or("no success")?;
    assert_eq!(last.id, newer);
    assert_ne!(last.id, older);
    Ok(())
}

#[tokio::test]
async fn file_snapshot_store_round_trip() -> TestResult {
    let dir = tempdir()?;
    let store = FileSnapshotStore::new(dir.path().join("job-state"));

    assert_eq!(store.load(1).await?, None);

    store.store(1, json!({ "cursor": 5, "seen": ["a", "b"] })).await?;
    assert_eq!(
        store.load(1).await?,
        Some(json!({ "cursor": 5, "seen": ["a", "b"] }))
    );

    store.store(1, json!(null)).await?;
    assert_eq!(store.load(1).await?, Some(json!(null)));

    store.delete(1).await?;
    assert_eq!(store.load(1).await?, None);

    // Deleting twice is fine.
    store.delete(1).await?;
    Ok(())
}

#[tokio::test]
async fn corrupt_snapshot_is_an_error() -> TestResult {
    let dir = tempdir()?;
    fs::write(dir.path().join("7.json"), "][")?;
    let store = FileSnapshotStore::new(dir.path());

    assert!(matches!(
        store.load(7).await,
        Err(JobvisorError::Snapshot(_))
    ));
    Ok(())
}
