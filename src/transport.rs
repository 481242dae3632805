// src/transport.rs

//! JSON-lines transport between the front and the worker.
//!
//! One [`HandlerMsg`] per line, e.g.
//! `{"type":"RUN","spec":{"jobId":5,"taskDir":"files/task-content/2/dist"}}`.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::engine::{HandlerMsg, WorkerHandle};
use crate::errors::{JobvisorError, Result};

/// Encode a message as a single line (without the trailing newline).
pub fn encode(msg: &HandlerMsg) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode(line: &str) -> Result<HandlerMsg> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Forward every message read from `reader` to the worker.
///
/// Blank and malformed lines are skipped. Returns the number of forwarded
/// messages once the reader hits EOF or the worker is gone.
pub async fn read_messages<R>(reader: R, handle: WorkerHandle) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let msg = match decode(&line) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, line = %line, "skipping malformed message");
                continue;
            }
        };

        debug!(?msg, "forwarding front message");
        match handle.send(msg).await {
            Ok(()) => forwarded += 1,
            Err(JobvisorError::ChannelClosed) => {
                info!("worker gone; stopping message reader");
                break;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(forwarded)
}
