// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{JobvisorError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = JobvisorError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

/// Run semantic validation against a raw configuration.
///
/// This checks:
/// - `[tasks].check_interval >= 1`
/// - `[tasks].content_dir` is not empty
/// - `[python].venv_cmd` is not blank
pub fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_tasks_section(cfg)?;
    validate_python_section(cfg)?;
    Ok(())
}

fn validate_tasks_section(cfg: &RawConfigFile) -> Result<()> {
    if cfg.tasks.check_interval == 0 {
        return Err(JobvisorError::ConfigError(
            "[tasks].check_interval must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.tasks.content_dir.as_os_str().is_empty() {
        return Err(JobvisorError::ConfigError(
            "[tasks].content_dir must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_python_section(cfg: &RawConfigFile) -> Result<()> {
    if cfg.python.venv_cmd.trim().is_empty() {
        return Err(JobvisorError::ConfigError(
            "[python].venv_cmd must not be empty".to_string(),
        ));
    }
    Ok(())
}
