//! External batch scheduler families.
//!
//! A family knows how to talk to one kind of scheduler: which programs submit
//! and cancel jobs, how to ask for the status of many jobs in one call, which
//! states mean "not finished yet", and how to read the answers.

mod ccc;
mod pbs;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{ClusterParameters, Mode};
use crate::error::HoplaError;
use crate::job::JobCommand;
use crate::shell::Shell;

pub use ccc::Ccc;
pub use pbs::Pbs;

/// Line printed by a submission script once its command succeeded.
pub const DONE_MARKER: &str = "HOPLASAY-DONE";

/// Submission of several commands as one job.
#[derive(Debug, Clone, Copy)]
pub struct MultiTask {
    /// Handlebars source of the submission script.
    pub template: &'static str,
    /// Launcher running every line of a task list, followed by the list path.
    pub launcher: &'static str,
}

/// What the scheduler reports about one job.
pub type StatusRecord = serde_json::Map<String, Value>;

/// State reported when nothing is known about a job.
pub const UNKNOWN_STATE: &str = "UNKNOWN";

#[async_trait]
pub trait SchedulerFamily: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Program taking the submission script path and printing the remote id.
    fn submit_program(&self) -> &str;

    /// Program taking the job id to cancel.
    fn cancel_program(&self) -> &str;

    /// Program and arguments listing the status of every job in `ids` at once.
    fn status_command(&self, ids: &[String]) -> (String, Vec<String>);

    /// States, upper-cased, of a job that has not finished yet.
    fn active_states(&self) -> &'static [&'static str];

    /// Parses the output of the status command, keyed by remote id.
    fn parse_status(&self, output: &str) -> Result<HashMap<String, StatusRecord>, HoplaError>;

    /// Extracts the remote id from the output of the submit program.
    fn parse_submission_id(&self, stdout: &str) -> String {
        last_token(stdout).to_string()
    }

    /// Rejects parameters this family cannot submit with.
    fn validate(&self, params: &ClusterParameters) -> Result<(), HoplaError>;

    /// Handlebars source of the submission script.
    fn batch_template(&self) -> &'static str;

    /// How to submit several commands as one job, if the family can.
    fn multi_task(&self) -> Option<MultiTask> {
        None
    }

    /// How the script invokes a job command.
    fn wrap_command(&self, command: &JobCommand, _params: &ClusterParameters) -> String {
        command.to_shell_line()
    }

    /// Inverse of [`SchedulerFamily::wrap_command`] on the parsed words.
    fn unwrap_command(&self, words: Vec<String>) -> Vec<String> {
        words
    }

    /// One-off work before the first submission of a run.
    async fn prepare(
        &self,
        _shell: &dyn Shell,
        _params: &ClusterParameters,
    ) -> Result<(), HoplaError> {
        Ok(())
    }
}

/// Family used for a cluster mode, `None` for local execution.
pub fn family_for(mode: Mode) -> Option<Arc<dyn SchedulerFamily>> {
    match mode {
        Mode::Local => None,
        Mode::Pbs => Some(Arc::new(Pbs)),
        Mode::Ccc => Some(Arc::new(Ccc)),
    }
}

/// Last whitespace-delimited token of the last non-empty line.
pub fn last_token(output: &str) -> &str {
    output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.split_whitespace().last())
        .unwrap_or_default()
}

/// The `job_state` of a record. A list of states gives its last element.
pub fn state_of(record: &StatusRecord) -> String {
    let state = match record.get("job_state") {
        Some(Value::Array(states)) => states.last(),
        other => other,
    };
    match state {
        Some(Value::String(state)) if !state.is_empty() => state.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => UNKNOWN_STATE.to_string(),
    }
}
