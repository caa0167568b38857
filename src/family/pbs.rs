use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ClusterParameters;
use crate::error::HoplaError;

use super::{last_token, SchedulerFamily, StatusRecord};

/// PBS/Torque: `qsub`, `qstat -F json`, `qdel`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pbs;

#[async_trait]
impl SchedulerFamily for Pbs {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn submit_program(&self) -> &str {
        "qsub"
    }

    fn cancel_program(&self) -> &str {
        "qdel"
    }

    fn status_command(&self, ids: &[String]) -> (String, Vec<String>) {
        let mut args = vec!["-fx".to_string(), "-F".to_string(), "json".to_string()];
        args.extend(ids.iter().cloned());
        ("qstat".to_string(), args)
    }

    fn active_states(&self) -> &'static [&'static str] {
        &["R", "Q", "S", "UNKNOWN"]
    }

    /// `{"Jobs": {"1234.server": {...}}}`, keyed without the server suffix.
    fn parse_status(&self, output: &str) -> Result<HashMap<String, StatusRecord>, HoplaError> {
        let parsed: Value = serde_json::from_str(output)?;
        let jobs = match parsed.get("Jobs") {
            Some(Value::Object(jobs)) => jobs,
            Some(other) => {
                return Err(HoplaError::SchedulerOutput(format!(
                    "qstat 'Jobs' is not an object: {}",
                    other
                )))
            }
            // qstat omits the key when it knows none of the jobs.
            None => return Ok(HashMap::new()),
        };
        jobs.iter()
            .map(|(key, record)| match record {
                Value::Object(record) => Ok((strip_server(key).to_string(), record.clone())),
                other => Err(HoplaError::SchedulerOutput(format!(
                    "qstat record of {} is not an object: {}",
                    key, other
                ))),
            })
            .collect()
    }

    /// qsub prints `1234.server`.
    fn parse_submission_id(&self, stdout: &str) -> String {
        strip_server(last_token(stdout)).to_string()
    }

    fn validate(&self, params: &ClusterParameters) -> Result<(), HoplaError> {
        if params.queue.is_none() {
            return Err(HoplaError::config("PBS submission requires a queue"));
        }
        if params.group_size > 1 {
            return Err(HoplaError::config("PBS does not support multi-task jobs"));
        }
        Ok(())
    }

    fn batch_template(&self) -> &'static str {
        include_str!("../templates/pbs_batch.hbs")
    }
}

fn strip_server(id: &str) -> &str {
    id.split('.').next().unwrap_or_default()
}
