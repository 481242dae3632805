// src/handler/python.rs

//! Handler for `python` and `numpy` tasks.
//!
//! Layout of a built task directory:
//!
//! ```text
//! <dest>/job.py        task code
//! <dest>/env/          virtual environment created by `init`
//! ```
//!
//! A run spawns `<dest>/env/bin/python job.py` inside `<dest>` and writes one
//! JSON line with params, entities, previous state and search endpoint to
//! its stdin. Stdout lines starting with `@request ` are requests to the
//! engine; the JSON response is written back as one line on stdin. All other
//! stdout is the run log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::SearchSection;
use crate::errors::Result;
use crate::handler::{BuildOutcome, HandlerFuture, RunContext, RunOutcome, TypeHandler};
use crate::paths::scratch_dir_for;
use crate::types::{RunId, TaskId};

const JOB_FILE_NAME: &str = "job.py";
const ENV_NAME: &str = "env";
/// Prefix marking a stdout line as a request to the engine.
pub const REQUEST_PREFIX: &str = "@request ";

pub struct PythonHandler {
    venv_cmd: String,
    packages: Vec<String>,
    search: SearchSection,
    /// Cancel channels of the runs currently executing.
    running: Arc<Mutex<HashMap<RunId, oneshot::Sender<()>>>>,
}

impl PythonHandler {
    pub fn new(venv_cmd: String, packages: Vec<String>, search: SearchSection) -> Self {
        Self {
            venv_cmd,
            packages,
            search,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn init_script(&self, env_dir: &Path) -> String {
        let env = shell_quote(&env_dir.to_string_lossy());
        let mut script = format!("{} {env}", self.venv_cmd);
        if !self.packages.is_empty() {
            let pip = shell_quote(&env_dir.join("bin").join("pip").to_string_lossy());
            script.push_str(&format!(" && {pip} install {}", self.packages.join(" ")));
        }
        script
    }
}

impl TypeHandler for PythonHandler {
    fn build(
        &self,
        task: TaskId,
        code: String,
        dest_dir: PathBuf,
    ) -> HandlerFuture<'static, BuildOutcome> {
        Box::pin(async move {
            let build_dir = scratch_dir_for(&dest_dir);
            let outcome = match build_job_file(&code, &build_dir, &dest_dir).await {
                Ok(()) => BuildOutcome::success(),
                Err(err) => {
                    warn!(task_id = task, error = %err, "build failed");
                    BuildOutcome::failure(format!("{err:#}"))
                }
            };
            remove_dir_if_exists(&build_dir).await;
            outcome
        })
    }

    fn init(
        &self,
        task: TaskId,
        code: String,
        dest_dir: PathBuf,
    ) -> HandlerFuture<'static, BuildOutcome> {
        let build_dir = scratch_dir_for(&dest_dir);
        let script = self.init_script(&build_dir.join(ENV_NAME));

        Box::pin(async move {
            info!(task_id = task, "initializing task environment");
            let outcome = match init_task_dir(&code, &script, &build_dir, &dest_dir).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(task_id = task, error = %err, "init failed");
                    BuildOutcome::failure(format!("{err:#}"))
                }
            };
            remove_dir_if_exists(&build_dir).await;
            outcome
        })
    }

    fn run(&self, ctx: RunContext) -> HandlerFuture<'static, RunOutcome> {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        self.running.lock().insert(ctx.run_id, cancel_tx);

        let running = Arc::clone(&self.running);
        let search = self.search.clone();

        Box::pin(async move {
            let run_id = ctx.run_id;
            let job_id = ctx.job_id;
            let outcome = match run_job(ctx, &search, cancel_rx).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(job_id, run_id, error = %err, "job execution error");
                    RunOutcome::Failure(format!("{err:#}"))
                }
            };
            running.lock().remove(&run_id);
            outcome
        })
    }

    fn stop(&self, run: RunId) -> HandlerFuture<'_, Result<()>> {
        Box::pin(async move {
            let cancel = self.running.lock().remove(&run);
            match cancel {
                Some(cancel) => {
                    if cancel.send(()).is_err() {
                        debug!(run_id = run, "run already finished while cancelling");
                    }
                }
                None => debug!(run_id = run, "no running process for run; nothing to stop"),
            }
            Ok(())
        })
    }

    fn remove(&self, task: TaskId) -> HandlerFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(task_id = task, "nothing to release for python task");
            Ok(())
        })
    }
}

async fn build_job_file(code: &str, build_dir: &Path, dest_dir: &Path) -> AnyResult<()> {
    empty_dir(build_dir).await?;

    let file = build_dir.join(JOB_FILE_NAME);
    tokio::fs::write(&file, code)
        .await
        .with_context(|| format!("writing {}", file.display()))?;

    tokio::fs::create_dir_all(dest_dir)
        .await
        .with_context(|| format!("creating {}", dest_dir.display()))?;
    tokio::fs::rename(&file, dest_dir.join(JOB_FILE_NAME))
        .await
        .with_context(|| format!("moving job file into {}", dest_dir.display()))?;
    Ok(())
}

async fn init_task_dir(
    code: &str,
    script: &str,
    build_dir: &Path,
    dest_dir: &Path,
) -> AnyResult<BuildOutcome> {
    empty_dir(build_dir).await?;
    tokio::fs::write(build_dir.join(JOB_FILE_NAME), code)
        .await
        .context("writing job file")?;

    debug!(script, "creating virtual environment");
    let out = Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .output()
        .await
        .context("spawning virtual environment setup")?;

    if !out.status.success() {
        let code = out.status.code().unwrap_or(-1);
        let mut log = String::from_utf8_lossy(&out.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&out.stderr));
        return Ok(BuildOutcome::failure(format!(
            "Init ended with code {code} and the following error:\n{log}"
        )));
    }

    remove_dir_if_exists(dest_dir).await;
    if let Some(parent) = dest_dir.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(build_dir, dest_dir)
        .await
        .with_context(|| format!("moving environment into {}", dest_dir.display()))?;

    Ok(BuildOutcome::success())
}

async fn run_job(
    ctx: RunContext,
    search: &SearchSection,
    mut cancel_rx: oneshot::Receiver<()>,
) -> AnyResult<RunOutcome> {
    let python = ctx.work_dir.join(ENV_NAME).join("bin").join("python");
    info!(
        job_id = ctx.job_id,
        run_id = ctx.run_id,
        work_dir = %ctx.work_dir.display(),
        "starting job process"
    );

    let mut child = Command::new(&python)
        .arg(JOB_FILE_NAME)
        .current_dir(&ctx.work_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {}", python.display()))?;

    let mut stdin: Option<ChildStdin> = child.stdin.take();
    let stdout = child.stdout.take().context("job stdout not captured")?;
    let stderr = child.stderr.take().context("job stderr not captured")?;

    let input = json!({
        "params": ctx.params,
        "entities": ctx.entities,
        "state": ctx.previous_state,
        "es": { "host": search.host, "port": search.port.to_string() },
    });
    if let Some(ref mut pipe) = stdin {
        write_line(pipe, &input.to_string())
            .await
            .context("writing job input")?;
    }

    // Always consume stderr so buffers don't fill; it becomes the error log.
    let err_log = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut log = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            log.push_str(&line);
            log.push('\n');
        }
        log
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut output = String::new();
    let mut stdout_open = true;
    let mut cancel_open = true;

    let status = loop {
        tokio::select! {
            line = lines.next_line(), if stdout_open => {
                match line.context("reading job stdout")? {
                    Some(line) => match line.strip_prefix(REQUEST_PREFIX) {
                        Some(request) => {
                            let response = ctx.requests.request(request).await;
                            if let Some(ref mut pipe) = stdin {
                                if let Err(err) = write_line(pipe, &response.to_string()).await {
                                    warn!(run_id = ctx.run_id, error = %err, "failed to answer job request");
                                }
                            }
                        }
                        None => {
                            output.push_str(&line);
                            output.push('\n');
                        }
                    },
                    None => {
                        stdout_open = false;
                        stdin = None;
                    }
                }
            }

            status = child.wait(), if !stdout_open => {
                break status.context("waiting for job process")?;
            }

            cancel = &mut cancel_rx, if cancel_open => {
                match cancel {
                    Ok(()) => {
                        info!(job_id = ctx.job_id, run_id = ctx.run_id, "stop requested; killing job process");
                        if let Err(err) = child.kill().await {
                            warn!(run_id = ctx.run_id, error = %err, "failed to kill job process");
                        }
                        return Ok(RunOutcome::Failure("Run cancelled.".to_string()));
                    }
                    Err(_) => cancel_open = false,
                }
            }
        }
    };

    let err_output = err_log.await.unwrap_or_default();
    let code = status.code().unwrap_or(-1);
    info!(
        job_id = ctx.job_id,
        run_id = ctx.run_id,
        exit_code = code,
        success = status.success(),
        "job process exited"
    );

    if status.success() {
        Ok(RunOutcome::Success {
            output,
            new_state: None,
        })
    } else {
        Ok(RunOutcome::Failure(format!(
            "Run failed with code {code}\n\nLog:\n{output}\n\nError log:\n{err_output}"
        )))
    }
}

async fn write_line(pipe: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    pipe.write_all(line.as_bytes()).await?;
    pipe.write_all(b"\n").await?;
    pipe.flush().await
}

async fn empty_dir(dir: &Path) -> AnyResult<()> {
    remove_dir_if_exists(dir).await;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))
}

async fn remove_dir_if_exists(dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %err, "failed to remove directory");
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

