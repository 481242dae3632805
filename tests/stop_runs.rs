// tests/stop_runs.rs

use std::error::Error;
use std::time::Duration;

use jobvisor::engine::{HandlerMsg, RUN_CANCELLED};
use jobvisor::handler::BuildOutcome;
use jobvisor::paths::task_build_output_dir;
use jobvisor::types::{BuildState, RunStatus};
use jobvisor_test_utils::{FakeHandler, Harness};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test(start_paused = true)]
async fn stopping_an_executing_run_goes_through_the_handler() -> TestResult {
    let h = Harness::with_handler(FakeHandler::new().manual_runs());
    let (_task, job) = h.add_task_and_job(|j| j).await;

    h.request_run(job).await;
    let run_id = h.handler.wait_for_runs(1).await.runs[0].run_id;

    h.stop(job, run_id).await;
    let run = h.wait_for_run_status(run_id, RunStatus::Failed).await;
    assert_eq!(run.output, RUN_CANCELLED);
    assert!(run.finished_at.is_some());

    // Stopping again is a no-op.
    h.stop(job, run_id).await;
    let view = h.view().await;
    assert!(view.live_jobs.is_empty());
    assert!(view.executing_runs.is_empty());
    assert_eq!(h.handler.calls().stops, vec![run_id]);
    assert_eq!(h.run(run_id).await.status, RunStatus::Failed);

    h.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_right_after_request_cancels_the_run() -> TestResult {
    let h = Harness::with_handler(FakeHandler::new().manual_runs());
    let (_task, job) = h.add_task_and_job(|j| j).await;

    let run_id = h.new_run(job).await;
    h.request_run_with_id(job, run_id).await;
    h.stop(job, run_id).await;
    h.stop(job, run_id).await;

    let run = h.wait_for_run_status(run_id, RunStatus::Failed).await;
    assert_eq!(run.output, RUN_CANCELLED);
    let view = h.wait_for_view(|v| v.live_jobs.is_empty()).await;
    assert_eq!(view.queued, 0);

    // Later stops leave the finished record alone.
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.stop(job, run_id).await;
    assert_eq!(h.view().await, view);
    let again = h.run(run_id).await;
    assert_eq!(again.finished_at, run.finished_at);
    assert_eq!(again.output, RUN_CANCELLED);

    // The job can run again, and a stale stop does not free its guard.
    let next = h.new_run(job).await;
    h.request_run_with_id(job, next).await;
    h.handler.wait_for(|c| c.run_ids().contains(&next)).await;
    h.stop(job, run_id).await;
    assert_eq!(h.view().await.live_jobs, vec![job]);
    assert_eq!(h.run(next).await.status, RunStatus::Running);

    h.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopping_a_delayed_run_releases_the_job() -> TestResult {
    let h = Harness::start();
    let (_task, job) = h.add_task_and_job(|j| j.delay(30)).await;

    h.request_run(job).await;
    let run_id = h.wait_for_run_count(job, 1).await[0].id;
    h.wait_for_view(|v| v.delayed_runs == vec![run_id]).await;

    h.stop(job, run_id).await;
    let run = h.wait_for_run_status(run_id, RunStatus::Failed).await;
    assert_eq!(run.output, RUN_CANCELLED);

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.stop(job, run_id).await;

    let view = h.view().await;
    assert!(view.delayed_runs.is_empty());
    assert!(view.live_jobs.is_empty());
    assert_eq!(h.run(run_id).await.finished_at, run.finished_at);

    // The cancelled timer never dispatches anything.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.handler.calls().runs.is_empty());
    assert_eq!(h.run(run_id).await.status, RunStatus::Failed);

    // A stale stop leaves the next delayed run of the job in place.
    h.request_run(job).await;
    let next = h.wait_for_run_count(job, 2).await[1].id;
    h.wait_for_view(|v| v.delayed_runs == vec![next]).await;
    h.stop(job, run_id).await;
    let view = h.view().await;
    assert_eq!(view.delayed_runs, vec![next]);
    assert_eq!(view.live_jobs, vec![job]);
    assert_eq!(h.run(run_id).await.output, RUN_CANCELLED);

    h.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopping_a_gap_deferred_run_releases_the_job() -> TestResult {
    let h = Harness::start();
    let (_task, job) = h.add_task_and_job(|j| j.min_gap(120)).await;

    h.request_run(job).await;
    let first = h.wait_for_run_count(job, 1).await[0].id;
    h.wait_for_run_status(first, RunStatus::Success).await;

    h.request_run(job).await;
    let second = h.wait_for_run_count(job, 2).await[1].id;
    h.wait_for_view(|v| v.deferred_runs == vec![second]).await;

    h.stop(job, second).await;
    let run = h.wait_for_run_status(second, RunStatus::Failed).await;
    assert_eq!(run.output, RUN_CANCELLED);
    assert!(h.view().await.live_jobs.is_empty());

    tokio::time::sleep(Duration::from_secs(180)).await;
    assert_eq!(h.handler.calls().run_ids(), vec![first]);

    h.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopping_a_build_waiting_run_drops_the_wait() -> TestResult {
    let h = Harness::with_handler(FakeHandler::new().manual_builds());
    let (task, job) = h.add_task_and_job(|j| j).await;

    h.send(HandlerMsg::Build {
        task_id: task,
        code: String::new(),
        dest_dir: task_build_output_dir(&h.content_dir, task),
    })
    .await;
    h.handler.wait_for_builds(1).await;

    h.request_run(job).await;
    let run_id = h.wait_for_run_count(job, 1).await[0].id;
    h.wait_for_view(|v| v.build_waiting_runs == vec![run_id]).await;

    h.stop(job, run_id).await;
    let run = h.wait_for_run_status(run_id, RunStatus::Failed).await;
    assert_eq!(run.output, RUN_CANCELLED);
    assert!(h.view().await.build_waiting_runs.is_empty());

    // Finishing the build does not resurrect the cancelled run.
    h.handler.complete_build(task, BuildOutcome::success());
    h.wait_for_build_state(task, BuildState::Finished).await;
    assert!(h.handler.calls().runs.is_empty());
    assert_eq!(h.run(run_id).await.status, RunStatus::Failed);

    h.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopping_unknown_or_finished_runs_is_harmless() -> TestResult {
    let h = Harness::start();
    let (_task, job) = h.add_task_and_job(|j| j).await;

    h.stop(job, 12345).await;

    h.request_run(job).await;
    let run_id = h.wait_for_run_count(job, 1).await[0].id;
    h.wait_for_run_status(run_id, RunStatus::Success).await;

    h.stop(job, run_id).await;
    h.stop(job, run_id).await;

    assert!(h.view().await.live_jobs.is_empty());
    assert_eq!(h.run(run_id).await.status, RunStatus::Success);
    assert!(h.handler.calls().stops.is_empty());

    h.shutdown().await;
    Ok(())
}
