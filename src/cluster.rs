//! Jobs submitted to an external batch scheduler.
//!
//! A [`ClusterExecutor`] holds what every job of a run shares: the base
//! folder, the resource parameters, the shell used to reach the scheduler and
//! the [`StatusWatcher`]. Each [`ClusterJob`] renders its submission script,
//! submits it, and then only ever learns about its progress through the
//! watcher.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use handlebars::Handlebars;
use itertools::Itertools;
use serde::Serialize;

use crate::config::ClusterParameters;
use crate::error::HoplaError;
use crate::family::{SchedulerFamily, DONE_MARKER};
use crate::job::{job_name, shell_quote, split_shell_words, JobCommand};
use crate::paths::JobPaths;
use crate::shell::Shell;
use crate::watcher::StatusWatcher;

const WORKER_SCRIPT: &str = include_str!("templates/worker.sh");

const EPILOGUE_SEPARATOR: &str = "##########";

/// Status of a job that was never submitted.
pub const NOT_STARTED: &str = "NOTSTARTED";

/// What one submission runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Single(JobCommand),
    /// Several commands run as the tasks of one job.
    Group(Vec<JobCommand>),
}

impl Submission {
    pub fn commands(&self) -> &[JobCommand] {
        match self {
            Submission::Single(command) => std::slice::from_ref(command),
            Submission::Group(commands) => commands,
        }
    }
}

/// Identifier handed back by the submit program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionId {
    Remote(String),
    /// The submission produced no usable identifier. Terminal.
    Exit,
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubmissionId::Remote(id) => f.write_str(id),
            SubmissionId::Exit => f.write_str("EXIT"),
        }
    }
}

pub struct ClusterExecutor {
    folder: PathBuf,
    params: ClusterParameters,
    watcher: Arc<StatusWatcher>,
    shell: Arc<dyn Shell>,
}

impl fmt::Debug for ClusterExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterExecutor")
            .field("folder", &self.folder)
            .finish_non_exhaustive()
    }
}

impl ClusterExecutor {
    /// Fails if the watcher's family cannot submit with `params`.
    pub fn new(
        folder: impl Into<PathBuf>,
        params: ClusterParameters,
        watcher: Arc<StatusWatcher>,
        shell: Arc<dyn Shell>,
    ) -> Result<Self, HoplaError> {
        watcher.family().validate(&params)?;
        Ok(Self {
            folder: folder.into(),
            params,
            watcher,
            shell,
        })
    }

    pub fn family(&self) -> &Arc<dyn SchedulerFamily> {
        self.watcher.family()
    }

    pub fn params(&self) -> &ClusterParameters {
        &self.params
    }

    pub fn watcher(&self) -> &Arc<StatusWatcher> {
        &self.watcher
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Family-specific work needed once before the first submission.
    pub async fn prepare(&self) -> Result<(), HoplaError> {
        self.family().prepare(self.shell.as_ref(), &self.params).await
    }

    pub fn job(
        self: &Arc<Self>,
        job_id: &str,
        submission: Submission,
    ) -> Result<ClusterJob, HoplaError> {
        Ok(ClusterJob {
            executor: Arc::clone(self),
            paths: JobPaths::new(&self.folder, job_id)?,
            submission,
            submission_id: None,
            submit_stderr: String::new(),
        })
    }

    /// One job per command, or one job per `group_size` commands when grouping.
    pub fn jobs(self: &Arc<Self>, commands: Vec<JobCommand>) -> Result<Vec<ClusterJob>, HoplaError> {
        let group_size = self.params.group_size.max(1);
        if group_size == 1 {
            return commands
                .into_iter()
                .enumerate()
                .map(|(index, command)| self.job(&job_name(index), Submission::Single(command)))
                .collect();
        }
        let groups = commands.into_iter().chunks(group_size);
        let mut jobs = vec![];
        for (index, group) in groups.into_iter().enumerate() {
            jobs.push(self.job(&job_name(index), Submission::Group(group.collect()))?);
        }
        Ok(jobs)
    }
}

/// Values available to the submission templates.
#[derive(Serialize)]
struct BatchData<'a> {
    job_id: &'a str,
    queue: &'a str,
    walltime: u64,
    memory: u64,
    ncpus: usize,
    ngpus: usize,
    project: Option<&'a str>,
    modules: String,
    stdout: String,
    stderr: String,
    command: String,
    ntasks: usize,
}

pub struct ClusterJob {
    executor: Arc<ClusterExecutor>,
    paths: JobPaths,
    submission: Submission,
    submission_id: Option<SubmissionId>,
    /// Standard error of the submit program.
    submit_stderr: String,
}

impl ClusterJob {
    pub fn job_id(&self) -> &str {
        self.paths.job_id()
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    /// `None` until started.
    pub fn submission_id(&self) -> Option<&SubmissionId> {
        self.submission_id.as_ref()
    }

    pub fn submit_stderr(&self) -> &str {
        &self.submit_stderr
    }

    /// Writes the submission script (and the task list of a group) and
    /// returns its path. Logs left by an earlier attempt are removed first.
    pub fn generate_batch(&self) -> Result<PathBuf, HoplaError> {
        for stale in [self.paths.stdout(), self.paths.stderr()] {
            match fs::remove_file(&stale) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }

        let family = self.executor.family();
        let params = self.executor.params();
        let (template, command, ntasks) = match &self.submission {
            Submission::Single(command) => (
                family.batch_template(),
                family.wrap_command(command, params),
                1,
            ),
            Submission::Group(commands) => {
                let multi = family.multi_task().ok_or_else(|| {
                    HoplaError::config(format!(
                        "{} does not support multi-task jobs",
                        family.name()
                    ))
                })?;
                let logdir = self.paths.task_log_dir();
                fs::create_dir_all(&logdir)?;
                let worker = self.paths.worker_file();
                fs::write(&worker, WORKER_SCRIPT)?;
                let mut tasks = commands
                    .iter()
                    .enumerate()
                    .map(|(index, command)| {
                        format!(
                            "{} bash {} {} {} {}",
                            params.nmulticpus,
                            shell_quote(&worker.to_string_lossy()),
                            index,
                            shell_quote(&logdir.to_string_lossy()),
                            family.wrap_command(command, params)
                        )
                    })
                    .join("\n");
                tasks.push('\n');
                fs::write(self.paths.task_file(), tasks)?;
                let launch = format!(
                    "{} {}",
                    multi.launcher,
                    shell_quote(&self.paths.task_file().to_string_lossy())
                );
                (multi.template, launch, commands.len())
            }
        };

        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        handlebars_misc_helpers::register(&mut registry);
        registry.register_template_string("batch", template)?;
        let data = BatchData {
            job_id: self.job_id(),
            queue: params.queue.as_deref().unwrap_or_default(),
            walltime: params.walltime_seconds(),
            memory: params.memory_megabytes(),
            ncpus: params.ncpus,
            ngpus: params.ngpus,
            project: params.project.as_deref(),
            modules: params.module_line(),
            stdout: self.paths.stdout().to_string_lossy().into_owned(),
            stderr: self.paths.stderr().to_string_lossy().into_owned(),
            command,
            ntasks,
        };
        let script = registry.render("batch", &data)?;
        let path = self.paths.submission_file();
        fs::write(&path, script)?;
        Ok(path)
    }

    /// Submits the job. Does nothing while an earlier submission is still
    /// running. Artifact errors are returned; a submission that yields no
    /// numeric identifier leaves the job in the `EXIT` state.
    pub async fn start(&mut self) -> Result<(), HoplaError> {
        if self.submission_id.is_some() && !self.done().await {
            return Ok(());
        }
        let script = self.generate_batch()?;
        let family = self.executor.family();
        let args = vec![script.to_string_lossy().into_owned()];
        let submission_id = match self.executor.shell.run(family.submit_program(), &args).await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                self.submit_stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let id = family.parse_submission_id(&stdout);
                if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
                    self.executor.watcher.register(&id).await;
                    tracing::info!(job = %self.job_id(), id = %id, "submitted");
                    SubmissionId::Remote(id)
                } else {
                    tracing::warn!(
                        job = %self.job_id(),
                        stdout = %stdout.trim(),
                        stderr = %self.submit_stderr,
                        "submission returned no job id"
                    );
                    SubmissionId::Exit
                }
            }
            Err(error) => {
                tracing::warn!(job = %self.job_id(), %error, "submission failed");
                self.submit_stderr = error.to_string();
                SubmissionId::Exit
            }
        };
        self.submission_id = Some(submission_id);
        Ok(())
    }

    /// Cancels the job unless it is already done or was never submitted.
    pub async fn stop(&self) -> Result<(), HoplaError> {
        if self.submission_id.is_none() || self.done().await {
            return Ok(());
        }
        let family = self.executor.family();
        let args = vec![self.job_id().to_string()];
        let output = self.executor.shell.run(family.cancel_program(), &args).await?;
        if !output.status.success() {
            tracing::warn!(
                job = %self.job_id(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "cancellation failed"
            );
        }
        Ok(())
    }

    /// Whether the job reached a terminal state.
    pub async fn done(&self) -> bool {
        match &self.submission_id {
            None => false,
            Some(SubmissionId::Exit) => true,
            Some(SubmissionId::Remote(id)) => self.executor.watcher.is_done(id).await,
        }
    }

    /// Scheduler state label of the job.
    pub async fn status(&self) -> String {
        match &self.submission_id {
            None => NOT_STARTED.to_string(),
            Some(SubmissionId::Exit) => SubmissionId::Exit.to_string(),
            Some(SubmissionId::Remote(id)) => self.executor.watcher.get_state(id).await,
        }
    }

    /// Whether the job's stdout holds the completion marker.
    pub fn succeeded(&self) -> bool {
        has_marker(&self.paths.stdout())
    }

    /// 0 when [`ClusterJob::succeeded`], 1 otherwise.
    pub fn exitcode(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    /// Multi-line summary of the job and of its files.
    pub async fn report(&self) -> String {
        let mut lines = vec![format!(
            "{} ({}): {} [{}]",
            self.job_id(),
            self.submission_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string()),
            self.status().await,
            if self.succeeded() { "success" } else { "failure" },
        )];
        lines.push(format!("- script: {}", self.paths.submission_file().display()));
        for (label, path) in [("stdout", self.paths.stdout()), ("stderr", self.paths.stderr())] {
            if path.exists() {
                lines.push(format!("- {}: {}", label, path.display()));
                let content = fs::read_to_string(&path).unwrap_or_default();
                lines.extend(content.lines().take(2).map(|line| format!("    {}", line)));
            } else {
                lines.push(format!("- {}: {} (missing)", label, path.display()));
            }
        }
        if self.submission_id == Some(SubmissionId::Exit) && !self.submit_stderr.is_empty() {
            lines.push(format!("- submission error: {}", self.submit_stderr));
        }
        if let Some(sub_report) = self.sub_report() {
            lines.push(sub_report);
        }
        lines.join("\n")
    }

    /// Task summary of a multi-task job.
    fn sub_report(&self) -> Option<String> {
        let Submission::Group(commands) = &self.submission else {
            return None;
        };
        let dir = self.paths.task_log_dir();
        let logs: Vec<PathBuf> = (0..commands.len())
            .map(|index| dir.join(format!("task_{}_log.out", index)))
            .collect();
        let seen = logs.iter().filter(|log| log.exists()).count();
        let unfinished = logs
            .iter()
            .enumerate()
            .filter(|(_, log)| !has_marker(log))
            .map(|(index, _)| index)
            .join(", ");
        Some(format!(
            "- tasks: {}, logs: {}, unfinished: [{}]",
            commands.len(),
            seen,
            unfinished
        ))
    }

    /// Command embedded in this job's submission script.
    pub fn embedded_command(&self) -> Result<JobCommand, HoplaError> {
        let script = fs::read_to_string(self.paths.submission_file())?;
        embedded_command(&script, self.executor.family().as_ref())
    }
}

/// Whether a log holds the completion marker above the scheduler's epilogue,
/// which starts at the first `##########` line.
fn has_marker(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|content| {
            content
                .lines()
                .take_while(|line| !line.starts_with(EPILOGUE_SEPARATOR))
                .any(|line| line.trim() == DONE_MARKER)
        })
        .unwrap_or(false)
}

/// Reads back the command a submission script runs: the line right before
/// the completion marker echo.
pub fn embedded_command(
    script: &str,
    family: &dyn SchedulerFamily,
) -> Result<JobCommand, HoplaError> {
    let marker = format!("echo \"{}\"", DONE_MARKER);
    let lines: Vec<&str> = script.lines().collect();
    let position = lines
        .iter()
        .position(|line| line.trim() == marker)
        .filter(|position| *position > 0)
        .ok_or_else(|| HoplaError::config("submission script has no command"))?;
    JobCommand::new(family.unwrap_command(split_shell_words(lines[position - 1])))
}
