// src/main.rs

use std::process::ExitCode;

use jobvisor::{cli, logging};

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("jobvisor: {err:#}");
        return ExitCode::FAILURE;
    }

    match jobvisor::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "worker terminated");
            eprintln!("jobvisor error: {err:?}");
            ExitCode::FAILURE
        }
    }
}
