use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ClusterParameters;
use crate::error::HoplaError;
use crate::job::{shell_quote, JobCommand};
use crate::shell::Shell;

use super::{MultiTask, SchedulerFamily, StatusRecord};

/// CEA computing centre (TGCC) machines: Slurm behind `ccc_msub`, with jobs
/// running inside `pcocc-rs` containers.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ccc;

/// Container image referenced by the cluster parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Name of the image on the hub.
    pub name: String,
    /// Docker archive to import the image from when the hub lacks it.
    pub archive: Option<String>,
}

impl Image {
    pub fn from_params(params: &ClusterParameters) -> Result<Self, HoplaError> {
        let image = params
            .image
            .as_deref()
            .ok_or_else(|| HoplaError::config("CCC submission requires an image"))?;
        let path = Path::new(image);
        if path.is_file() {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let name = file_name.split('.').next().unwrap_or_default().to_string();
            Ok(Self {
                name,
                archive: Some(image.to_string()),
            })
        } else {
            Ok(Self {
                name: image.to_string(),
                archive: None,
            })
        }
    }
}

/// Image names out of `pcocc-rs image list`: a two-line header, one image per
/// line, and a two-line footer.
pub fn parse_image_index(output: &str) -> Vec<String> {
    let lines: Vec<&str> = output.split('\n').collect();
    if lines.len() <= 4 {
        return vec![];
    }
    lines[2..lines.len() - 2]
        .iter()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl SchedulerFamily for Ccc {
    fn name(&self) -> &'static str {
        "ccc"
    }

    fn submit_program(&self) -> &str {
        "ccc_msub"
    }

    fn cancel_program(&self) -> &str {
        "ccc_mqdel"
    }

    fn status_command(&self, ids: &[String]) -> (String, Vec<String>) {
        (
            "squeue".to_string(),
            vec![
                "--states=all".to_string(),
                "--json".to_string(),
                "-j".to_string(),
                ids.join(","),
            ],
        )
    }

    fn active_states(&self) -> &'static [&'static str] {
        &[
            "RUNNING",
            "PENDING",
            "SUSPENDED",
            "COMPLETING",
            "CONFIGURING",
            "UNKNOWN",
        ]
    }

    /// `{"jobs": [{"job_id": 1234, "job_state": ["RUNNING"], ...}]}`.
    fn parse_status(&self, output: &str) -> Result<HashMap<String, StatusRecord>, HoplaError> {
        let parsed: Value = serde_json::from_str(output)?;
        let jobs = parsed
            .get("jobs")
            .and_then(Value::as_array)
            .ok_or_else(|| HoplaError::SchedulerOutput("squeue output has no 'jobs' list".into()))?;
        let mut info = HashMap::with_capacity(jobs.len());
        for job in jobs {
            let record = job.as_object().ok_or_else(|| {
                HoplaError::SchedulerOutput(format!("squeue job is not an object: {}", job))
            })?;
            let id = match record.get("job_id") {
                Some(Value::Number(id)) => id.to_string(),
                Some(Value::String(id)) => id.clone(),
                _ => {
                    return Err(HoplaError::SchedulerOutput(format!(
                        "squeue job without 'job_id': {}",
                        job
                    )))
                }
            };
            info.insert(id, record.clone());
        }
        Ok(info)
    }

    fn validate(&self, params: &ClusterParameters) -> Result<(), HoplaError> {
        if params.queue.is_none() {
            return Err(HoplaError::config("CCC submission requires a queue"));
        }
        if params.group_size == 0 || params.nmulticpus == 0 {
            return Err(HoplaError::config(
                "'group_size' and 'nmulticpus' must be at least 1",
            ));
        }
        Image::from_params(params).map(|_| ())
    }

    fn batch_template(&self) -> &'static str {
        include_str!("../templates/ccc_batch.hbs")
    }

    fn multi_task(&self) -> Option<MultiTask> {
        Some(MultiTask {
            template: include_str!("../templates/ccc_multi_batch.hbs"),
            launcher: "ccc_mprun -f",
        })
    }

    fn wrap_command(&self, command: &JobCommand, params: &ClusterParameters) -> String {
        let image = params.image.as_deref().map(|_| Image::from_params(params));
        match image {
            Some(Ok(image)) => format!(
                "pcocc-rs run {} {}",
                shell_quote(&format!("{}:{}", params.hub, image.name)),
                command.to_shell_line()
            ),
            _ => command.to_shell_line(),
        }
    }

    fn unwrap_command(&self, words: Vec<String>) -> Vec<String> {
        match words.as_slice() {
            [pcocc, run, _image, ..] if pcocc == "pcocc-rs" && run == "run" => words[3..].to_vec(),
            _ => words,
        }
    }

    /// Imports the image on the hub if it is not there yet.
    async fn prepare(
        &self,
        shell: &dyn Shell,
        params: &ClusterParameters,
    ) -> Result<(), HoplaError> {
        let image = Image::from_params(params)?;
        let index = shell
            .check_output(
                "pcocc-rs",
                &[
                    "image".to_string(),
                    "list".to_string(),
                    "-r".to_string(),
                    params.hub.clone(),
                ],
            )
            .await?;
        if parse_image_index(&index).contains(&image.name) {
            return Ok(());
        }
        let archive = image.archive.ok_or_else(|| {
            HoplaError::Image(format!(
                "'{}' image not available on {}. Please consider providing the image archive.",
                image.name, params.hub
            ))
        })?;
        tracing::info!(image = %image.name, hub = %params.hub, "importing container image");
        shell
            .check_output(
                "pcocc-rs",
                &[
                    "image".to_string(),
                    "import".to_string(),
                    format!("docker-archive:{}", archive),
                    format!("{}:{}", params.hub, image.name),
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUEUE: &str = r#"{
        "meta": {"plugin": {"type": "openapi/v0.0.38"}},
        "errors": [],
        "jobs": [
            {"job_id": 4321, "name": "job_0", "job_state": ["RUNNING"]},
            {"job_id": 4322, "name": "job_1", "job_state": "COMPLETED"}
        ]
    }"#;

    fn params_with_image(image: &str) -> ClusterParameters {
        ClusterParameters {
            queue: Some("rome".to_string()),
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_status() {
        let info = Ccc.parse_status(SQUEUE).unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info["4321"]["job_state"], serde_json::json!(["RUNNING"]));
        assert_eq!(info["4322"]["name"], "job_1");
    }

    #[test]
    fn test_parse_status_rejects_missing_jobs() {
        assert!(Ccc.parse_status(r#"{"errors": []}"#).is_err());
        assert!(Ccc.parse_status(r#"{"jobs": [{"name": "x"}]}"#).is_err());
    }

    #[test]
    fn test_status_command_joins_ids_with_commas() {
        let (program, args) = Ccc.status_command(&["1".to_string(), "2".to_string()]);
        assert_eq!(program, "squeue");
        assert_eq!(args, vec!["--states=all", "--json", "-j", "1,2"]);
    }

    #[test]
    fn test_parse_submission_id() {
        assert_eq!(Ccc.parse_submission_id("Submitted Batch Session 12345\n"), "12345");
    }

    #[test]
    fn test_image_from_name_or_archive() {
        let image = Image::from_params(&params_with_image("brainprep")).unwrap();
        assert_eq!(image.name, "brainprep");
        assert_eq!(image.archive, None);

        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("brainprep.tar.gz");
        std::fs::write(&archive, b"").unwrap();
        let image = Image::from_params(&params_with_image(archive.to_str().unwrap())).unwrap();
        assert_eq!(image.name, "brainprep");
        assert_eq!(image.archive.as_deref(), archive.to_str());
    }

    #[test]
    fn test_validate_requires_image() {
        let mut params = params_with_image("brainprep");
        assert!(Ccc.validate(&params).is_ok());
        params.image = None;
        assert!(Ccc.validate(&params).unwrap_err().is_config());
    }

    #[test]
    fn test_wrap_command_runs_in_container() {
        let params = params_with_image("brainprep");
        let command = JobCommand::new(["ls", "/tmp"]).unwrap();
        assert_eq!(
            Ccc.wrap_command(&command, &params),
            "pcocc-rs run n4h00001rs:brainprep ls /tmp"
        );
    }

    #[test]
    fn test_unwrap_command_drops_container_prefix() {
        let params = params_with_image("brainprep");
        let command = JobCommand::new(["ls", "-l", "/tmp dir"]).unwrap();
        let line = Ccc.wrap_command(&command, &params);
        let words = Ccc.unwrap_command(crate::job::split_shell_words(&line));
        assert_eq!(words, command.words());
    }

    #[test]
    fn test_parse_image_index() {
        let output = "NAME   TYPE  SIZE\n---------------\nbrainprep  docker 1G\nfsl docker 2G\n---------------\n";
        assert_eq!(parse_image_index(output), vec!["brainprep", "fsl"]);
        assert!(parse_image_index("").is_empty());
    }
}
