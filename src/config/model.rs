// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [tasks]
/// check_interval = 10
/// content_dir = "files/task-content"
///
/// [jobs]
/// run_log_retention_days = 7
///
/// [storage]
/// ledger_path = "state/ledger.json"
/// snapshot_dir = "state/job-state"
///
/// [python]
/// venv_cmd = "python3 -m venv"
///
/// [search]
/// host = "localhost"
/// port = 9200
/// ```
///
/// All sections are optional and have reasonable defaults. This is the raw,
/// unvalidated form; the rest of the crate works with [`ConfigFile`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub tasks: TasksSection,

    #[serde(default)]
    pub jobs: JobsSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub python: PythonSection,

    #[serde(default)]
    pub search: SearchSection,
}

/// Validated configuration. Only constructible through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub tasks: TasksSection,
    pub jobs: JobsSection,
    pub storage: StorageSection,
    pub python: PythonSection,
    pub search: SearchSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            tasks: raw.tasks,
            jobs: raw.jobs,
            storage: raw.storage,
            python: raw.python,
            search: raw.search,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.tasks.check_interval)
    }

    /// Retention window for finished runs, `None` when pruning is disabled.
    pub fn run_log_retention(&self) -> Option<Duration> {
        match self.jobs.run_log_retention_days {
            0 => None,
            days => Some(Duration::from_secs(days * 24 * 60 * 60)),
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::new_unchecked(RawConfigFile::default())
    }
}

/// `[tasks]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TasksSection {
    /// Seconds between two time-trigger scans.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Root directory holding one sub-directory per task.
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,
}

fn default_check_interval() -> u64 {
    10
}

fn default_content_dir() -> PathBuf {
    PathBuf::from("files/task-content")
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            content_dir: default_content_dir(),
        }
    }
}

/// `[jobs]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct JobsSection {
    /// Finished runs older than this many days are pruned. `0` keeps them.
    #[serde(default)]
    pub run_log_retention_days: u64,
}

/// `[storage]` section.
///
/// Omitted paths select the in-memory implementations, which is handy for
/// local experiments but loses everything on restart.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,

    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

/// `[python]` section used by the Python/NumPy handler.
#[derive(Debug, Clone, Deserialize)]
pub struct PythonSection {
    #[serde(default = "default_venv_cmd")]
    pub venv_cmd: String,

    #[serde(default = "default_base_packages")]
    pub base_packages: Vec<String>,

    #[serde(default = "default_numpy_packages")]
    pub numpy_packages: Vec<String>,
}

fn default_venv_cmd() -> String {
    "python3 -m venv".to_string()
}

fn default_base_packages() -> Vec<String> {
    vec!["elasticsearch".to_string()]
}

fn default_numpy_packages() -> Vec<String> {
    vec!["elasticsearch".to_string(), "numpy".to_string()]
}

impl Default for PythonSection {
    fn default() -> Self {
        Self {
            venv_cmd: default_venv_cmd(),
            base_packages: default_base_packages(),
            numpy_packages: default_numpy_packages(),
        }
    }
}

/// `[search]` section, handed to job processes so they can reach the index.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    #[serde(default = "default_search_host")]
    pub host: String,

    #[serde(default = "default_search_port")]
    pub port: u16,
}

fn default_search_host() -> String {
    "localhost".to_string()
}

fn default_search_port() -> u16 {
    9200
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            host: default_search_host(),
            port: default_search_port(),
        }
    }
}
