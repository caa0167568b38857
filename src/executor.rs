//! How a local worker runs one job.
//!
//! A job either succeeds and hands back a [`Trace`] of named values it wants
//! reported, or fails with a diagnostic. [`ProcessExecutor`] runs the command
//! as a subprocess; the job exposes values by writing a JSON object to the file
//! named by the `HOPLA_TRACE_FILE` environment variable.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::error::HoplaError;
use crate::job::JobCommand;

/// Environment variable holding the path a job writes its trace to.
pub const TRACE_ENV: &str = "HOPLA_TRACE_FILE";

/// Named values a job chose to report, copied into the result `info`.
pub type Trace = BTreeMap<String, Value>;

#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, command: &JobCommand) -> Result<Trace, HoplaError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, command: &JobCommand) -> Result<Trace, HoplaError> {
        let trace_file = tempfile::Builder::new()
            .prefix("hopla-trace-")
            .suffix(".json")
            .tempfile()?;
        let output = Command::new(command.program())
            .args(command.args())
            .env(TRACE_ENV, trace_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(HoplaError::CommandFailed {
                command: command.to_shell_line(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        read_trace(trace_file.path())
    }
}

/// Reads a trace file. A missing or empty file is an empty trace.
pub fn read_trace(path: &Path) -> Result<Trace, HoplaError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Trace::new()),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(Trace::new());
    }
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(other) => Err(HoplaError::Trace {
            path: path.to_path_buf(),
            reason: format!("expected a JSON object, got {}", other),
        }),
        Err(e) => Err(HoplaError::Trace {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}
