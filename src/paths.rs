// src/paths.rs

//! On-disk layout of task content.
//!
//! ```text
//! <content_dir>/<task id>/        task directory
//! <content_dir>/<task id>/dist    build output, used as the job working dir
//! <content_dir>/<task id>/build   scratch directory used while building
//! ```

use std::path::{Path, PathBuf};

use crate::types::TaskId;

pub fn task_dir(content_dir: &Path, id: TaskId) -> PathBuf {
    content_dir.join(id.to_string())
}

pub fn task_build_output_dir(content_dir: &Path, id: TaskId) -> PathBuf {
    task_dir(content_dir, id).join("dist")
}

/// Scratch directory next to a build output directory.
pub fn scratch_dir_for(dest_dir: &Path) -> PathBuf {
    match dest_dir.parent() {
        Some(parent) => parent.join("build"),
        None => PathBuf::from("build"),
    }
}
