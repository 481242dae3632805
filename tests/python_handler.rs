// tests/python_handler.rs

use std::error::Error;
use std::fs;

use tempfile::tempdir;

use jobvisor::config::SearchSection;
use jobvisor::handler::python::PythonHandler;
use jobvisor::handler::{BuildOutcome, TypeHandler};

type TestResult = Result<(), Box<dyn Error>>;

fn handler(venv_cmd: &str) -> PythonHandler {
    PythonHandler::new(venv_cmd.to_string(), Vec::new(), SearchSection::default())
}

#[tokio::test]
async fn build_writes_job_file_and_cleans_scratch_dir() -> TestResult {
    let dir = tempdir()?;
    let dest = dir.path().join("1").join("dist");

    let outcome = handler("true")
        .build(1, "print('built')".to_string(), dest.clone())
        .await;

    assert_eq!(outcome, BuildOutcome::success());
    assert_eq!(fs::read_to_string(dest.join("job.py"))?, "print('built')");
    assert!(!dir.path().join("1").join("build").exists());
    Ok(())
}

#[tokio::test]
async fn rebuild_replaces_previous_code() -> TestResult {
    let dir = tempdir()?;
    let dest = dir.path().join("7").join("dist");
    let python = handler("true");

    python.build(7, "v = 1".to_string(), dest.clone()).await;
    let outcome = python.build(7, "v = 2".to_string(), dest.clone()).await;

    assert!(outcome.is_success());
    assert_eq!(fs::read_to_string(dest.join("job.py"))?, "v = 2");
    Ok(())
}

#[tokio::test]
async fn init_moves_environment_into_place() -> TestResult {
    let dir = tempdir()?;
    let dest = dir.path().join("2").join("dist");

    let outcome = handler("mkdir -p")
        .init(2, "print('init')".to_string(), dest.clone())
        .await;

    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    assert_eq!(fs::read_to_string(dest.join("job.py"))?, "print('init')");
    assert!(dest.join("env").is_dir());
    assert!(!dir.path().join("2").join("build").exists());
    Ok(())
}

#[tokio::test]
async fn failed_environment_setup_reports_exit_code() -> TestResult {
    let dir = tempdir()?;
    let dest = dir.path().join("3").join("dist");

    let outcome = handler("false")
        .init(3, "print('never')".to_string(), dest.clone())
        .await;

    match outcome {
        BuildOutcome::Failure { errors, .. } => {
            assert_eq!(errors.len(), 1);
            assert!(
                errors[0].starts_with("Init ended with code 1"),
                "unexpected error: {}",
                errors[0]
            );
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!dest.exists());
    assert!(!dir.path().join("3").join("build").exists());
    Ok(())
}

#[tokio::test]
async fn stopping_unknown_run_is_ignored() -> TestResult {
    let python = handler("true");
    python.stop(999).await?;
    python.remove(1).await?;
    Ok(())
}
