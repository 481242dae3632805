// tests/recovery_and_retention.rs

use std::error::Error;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use jobvisor::clock::{Clock, FakeClock};
use jobvisor::ledger::{Ledger, MemoryLedger};
use jobvisor::recovery::{CANCELLED_UPON_START, RecoveryReport, recover};
use jobvisor::retention::{prune_once, spawn_retention};
use jobvisor::types::{BuildState, RunStatus, RunUpdate};
use jobvisor_test_utils::{FakeHandler, Harness, JobBuilder, TaskBuilder};

type TestResult = Result<(), Box<dyn Error>>;

fn start_clock() -> FakeClock {
    FakeClock::new(
        Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0)
            .single()
            .expect("valid date"),
    )
}

#[tokio::test]
async fn recovery_fails_active_runs_and_resets_builds() -> TestResult {
    let ledger = MemoryLedger::new();
    let clock = start_clock();
    let now = clock.now();

    let initializing = ledger
        .insert_task(TaskBuilder::new("a").build_state(BuildState::Initializing).build())
        .await?;
    let processing = ledger
        .insert_task(TaskBuilder::new("b").build_state(BuildState::Processing).build())
        .await?;
    let scheduled = ledger
        .insert_task(TaskBuilder::new("c").build_state(BuildState::Scheduled).build())
        .await?;
    let finished = ledger.insert_task(TaskBuilder::new("d").build()).await?;

    let job = ledger.insert_job(JobBuilder::new(finished).build()).await?;
    let running = ledger.create_run(job, RunStatus::Running, now).await?;
    let queued = ledger.create_run(job, RunStatus::Scheduled, now).await?;
    let initial = ledger.create_run(job, RunStatus::Initialization, now).await?;
    let done = ledger.create_run(job, RunStatus::Success, now).await?;
    ledger
        .update_run(done, RunUpdate::status(RunStatus::Success).with_output("fine"))
        .await?;

    clock.advance(Duration::from_secs(5));
    let report = recover(&ledger, &clock).await?;
    assert_eq!(
        report,
        RecoveryReport {
            runs_failed: 3,
            tasks_reset: 3,
        }
    );

    for id in [running, queued, initial] {
        let run = ledger.get_run(id).await?.ok_or("run missing")?;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.output, CANCELLED_UPON_START);
        assert_eq!(run.finished_at, Some(clock.now()));
    }
    let done = ledger.get_run(done).await?.ok_or("run missing")?;
    assert_eq!(done.status, RunStatus::Success);
    assert_eq!(done.output, "fine");

    let state = |id| {
        let ledger = &ledger;
        async move { ledger.get_task(id).await.map(|t| t.map(|t| t.build_state)) }
    };
    assert_eq!(state(initializing).await?, Some(BuildState::Uninitialized));
    assert_eq!(state(processing).await?, Some(BuildState::Failed));
    assert_eq!(state(scheduled).await?, Some(BuildState::Failed));
    assert_eq!(state(finished).await?, Some(BuildState::Finished));

    let reset = ledger.get_task(processing).await?.ok_or("task missing")?;
    assert_eq!(
        reset.build_output.map(|o| o.errors),
        Some(vec![CANCELLED_UPON_START.to_string()])
    );

    // Nothing left to recover on a second pass.
    assert_eq!(recover(&ledger, &clock).await?, RecoveryReport::default());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn recovered_tasks_can_be_rebuilt_and_run() -> TestResult {
    let ledger = MemoryLedger::new();
    let task = ledger
        .insert_task(TaskBuilder::new("t").build_state(BuildState::Processing).build())
        .await?;
    let job = ledger.insert_job(JobBuilder::new(task).build()).await?;
    let stale = ledger
        .create_run(job, RunStatus::Running, Utc::now())
        .await?;

    recover(&ledger, &start_clock()).await?;

    let h = Harness::with_ledger(FakeHandler::new(), ledger);
    assert_eq!(h.run(stale).await.status, RunStatus::Failed);

    // The task is failed now, so a run is refused until it is rebuilt.
    h.request_run(job).await;
    let refused = h.wait_for_run_count(job, 2).await[1].id;
    let refused = h.wait_for_run_status(refused, RunStatus::Failed).await;
    assert_eq!(refused.output, "Task t is not build.");

    h.control().compile(task).await?;
    h.wait_for_build_state(task, BuildState::Finished).await;

    h.request_run(job).await;
    let run = h.wait_for_run_count(job, 3).await[2].id;
    h.wait_for_run_status(run, RunStatus::Success).await;

    h.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn prune_removes_only_old_finished_runs() -> TestResult {
    let ledger = MemoryLedger::new();
    let clock = start_clock();
    let task = ledger.insert_task(TaskBuilder::new("t").build()).await?;
    let job = ledger.insert_job(JobBuilder::new(task).build()).await?;

    let day = chrono::Duration::days(1);
    let old_done = ledger.create_run(job, RunStatus::Success, clock.now() - day * 10).await?;
    ledger
        .update_run(
            old_done,
            RunUpdate::status(RunStatus::Success).finished_at(clock.now() - day * 10),
        )
        .await?;
    let old_failed = ledger.create_run(job, RunStatus::Failed, clock.now() - day * 8).await?;
    ledger
        .update_run(
            old_failed,
            RunUpdate::status(RunStatus::Failed).finished_at(clock.now() - day * 8),
        )
        .await?;
    let recent = ledger.create_run(job, RunStatus::Success, clock.now() - day).await?;
    ledger
        .update_run(recent, RunUpdate::status(RunStatus::Success).finished_at(clock.now() - day))
        .await?;
    // Old but still active: never pruned.
    let active = ledger.create_run(job, RunStatus::Running, clock.now() - day * 30).await?;

    let removed = prune_once(&ledger, &clock, Duration::from_secs(7 * 24 * 3600)).await?;
    assert_eq!(removed, 2);

    assert!(ledger.get_run(old_done).await?.is_none());
    assert!(ledger.get_run(old_failed).await?.is_none());
    assert!(ledger.get_run(recent).await?.is_some());
    assert!(ledger.get_run(active).await?.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retention_task_prunes_at_start_and_periodically() -> TestResult {
    let ledger = std::sync::Arc::new(MemoryLedger::new());
    let clock = std::sync::Arc::new(start_clock());
    let task = ledger.insert_task(TaskBuilder::new("t").build()).await?;
    let job = ledger.insert_job(JobBuilder::new(task).build()).await?;

    let finish = |at| RunUpdate::status(RunStatus::Success).finished_at(at);
    let old = ledger.create_run(job, RunStatus::Success, clock.now()).await?;
    ledger
        .update_run(old, finish(clock.now() - chrono::Duration::hours(2)))
        .await?;
    let fresh = ledger.create_run(job, RunStatus::Success, clock.now()).await?;
    ledger.update_run(fresh, finish(clock.now())).await?;

    let pruner = spawn_retention(ledger.clone(), clock.clone(), Duration::from_secs(3600));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(ledger.get_run(old).await?.is_none());
    assert!(ledger.get_run(fresh).await?.is_some());

    // Two hours later the second run is old too.
    clock.advance(Duration::from_secs(2 * 3600));
    tokio::time::sleep(Duration::from_secs(3601)).await;
    assert!(ledger.get_run(fresh).await?.is_none());

    pruner.abort();
    Ok(())
}
