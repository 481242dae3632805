// src/ledger/file.rs

//! JSON file persistence for [`LedgerState`].

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::info;

use crate::errors::{JobvisorError, Result};
use crate::ledger::memory::LedgerState;

/// Load ledger state from `path`. A missing file yields an empty ledger.
pub fn load_state(path: &Path) -> Result<LedgerState> {
    match fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(LedgerState::default()),
        Ok(contents) => serde_json::from_str(&contents).map_err(|err| {
            JobvisorError::Ledger(format!("corrupt ledger file {}: {err}", path.display()))
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "ledger file not found; starting empty");
            Ok(LedgerState::default())
        }
        Err(err) => Err(err.into()),
    }
}

/// Write serialized ledger state to `path` through a temporary sibling file,
/// so a crash mid-write leaves the previous contents intact. Blocking; the
/// ledger calls it from `spawn_blocking`.
pub fn save_state(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
