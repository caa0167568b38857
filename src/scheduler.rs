//! Top-level entry point: runs one batch of jobs and reports on each of them.
//!
//! In local mode the commands go through a [`WorkerPool`]. In cluster mode
//! each command (or group of commands) becomes a [`ClusterJob`]; the jobs are
//! submitted, then polled through their shared watcher until every one of
//! them is done or the user interrupts the run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cluster::{ClusterExecutor, ClusterJob, Submission, SubmissionId};
use crate::config::{ClusterParameters, Config, Mode};
use crate::error::HoplaError;
use crate::executor::{JobExecutor, ProcessExecutor};
use crate::family::{family_for, SchedulerFamily};
use crate::job::{into_tasks, JobCommand, JobResult};
use crate::pool::WorkerPool;
use crate::shell::{LocalShell, Shell};
use crate::watcher::StatusWatcher;

/// Outcome of a run, one entry per job in both maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub status: BTreeMap<String, JobResult>,
    /// 0 for a successful job, non-zero otherwise.
    pub exitcodes: BTreeMap<String, i32>,
}

impl Report {
    fn insert(&mut self, result: JobResult) {
        let code = if result.succeeded() { 0 } else { 1 };
        self.exitcodes.insert(result.job_name.clone(), code);
        self.status.insert(result.job_name.clone(), result);
    }

    pub fn failures(&self) -> usize {
        self.exitcodes.values().filter(|code| **code != 0).count()
    }

    /// Writes `status.json` and `exitcodes.json` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<(), HoplaError> {
        fs::create_dir_all(dir)?;
        fs::write(
            dir.join("status.json"),
            serde_json::to_string_pretty(&self.status)?,
        )?;
        fs::write(
            dir.join("exitcodes.json"),
            serde_json::to_string_pretty(&self.exitcodes)?,
        )?;
        Ok(())
    }
}

pub struct Scheduler {
    mode: Mode,
    workers: usize,
    params: ClusterParameters,
    logdir: Option<PathBuf>,
    outputdir: Option<PathBuf>,
    delay: Duration,
    poll_interval: Duration,
    executor: Arc<dyn JobExecutor>,
    shell: Arc<dyn Shell>,
}

impl Scheduler {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            workers: 1,
            params: ClusterParameters::default(),
            logdir: None,
            outputdir: None,
            delay: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            executor: Arc::new(ProcessExecutor),
            shell: Arc::new(LocalShell),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, HoplaError> {
        let mut scheduler = Self::new(config.mode)
            .with_workers(config.cpus)
            .with_params(config.cluster_parameters()?)
            .with_delay(config.delay())
            .with_poll_interval(config.poll_interval());
        scheduler.logdir = config.logdir.clone();
        scheduler.outputdir = config.outputdir.clone();
        Ok(scheduler)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_params(mut self, params: ClusterParameters) -> Self {
        self.params = params;
        self
    }

    pub fn with_logdir(mut self, logdir: impl Into<PathBuf>) -> Self {
        self.logdir = Some(logdir.into());
        self
    }

    pub fn with_outputdir(mut self, outputdir: impl Into<PathBuf>) -> Self {
        self.outputdir = Some(outputdir.into());
        self
    }

    /// Minimum interval between two live status queries.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Interval between two completion checks in cluster mode.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_shell(mut self, shell: Arc<dyn Shell>) -> Self {
        self.shell = shell;
        self
    }

    /// Rejects inputs that cannot be scheduled, before anything runs.
    fn validate(&self, commands: &[JobCommand]) -> Result<Option<Arc<dyn SchedulerFamily>>, HoplaError> {
        if commands.is_empty() {
            return Err(HoplaError::config("no command to run"));
        }
        let family = match family_for(self.mode) {
            None => {
                if self.workers == 0 {
                    return Err(HoplaError::config("local mode needs at least one cpu"));
                }
                return Ok(None);
            }
            Some(family) => family,
        };
        let logdir = self.logdir.as_ref().ok_or_else(|| {
            HoplaError::config(format!("{} mode requires a log directory", family.name()))
        })?;
        if logdir.exists() && fs::read_dir(logdir)?.next().is_some() {
            return Err(HoplaError::config(format!(
                "log directory {} is not empty",
                logdir.display()
            )));
        }
        family.validate(&self.params)?;
        Ok(Some(family))
    }

    /// Runs every command to completion. Only invalid inputs are errors;
    /// job failures end up in the report.
    pub async fn run(&self, commands: Vec<JobCommand>) -> Result<Report, HoplaError> {
        let family = self.validate(&commands)?;
        if let Some(outputdir) = &self.outputdir {
            fs::create_dir_all(outputdir)?;
        }
        let report = match family {
            None => self.run_local(commands).await?,
            Some(family) => self.run_cluster(family, commands).await?,
        };
        if let Some(outputdir) = &self.outputdir {
            report.write(outputdir)?;
        }
        tracing::info!(
            jobs = report.exitcodes.len(),
            failures = report.failures(),
            "run finished"
        );
        Ok(report)
    }

    async fn run_local(&self, commands: Vec<JobCommand>) -> Result<Report, HoplaError> {
        tracing::info!(jobs = commands.len(), workers = self.workers, "running locally");
        let pool = WorkerPool::new(self.workers, Arc::clone(&self.executor))?;
        let tasks = into_tasks(commands);
        let outcome = pool.run(tasks.clone()).await;
        if outcome.finished_workers != pool.workers() {
            tracing::warn!(
                finished = outcome.finished_workers,
                workers = pool.workers(),
                "some workers never reported back"
            );
        }

        let mut report = Report::default();
        for result in outcome.results {
            report.insert(result);
        }
        for task in tasks {
            if !report.status.contains_key(&task.name) {
                let mut result = JobResult::new(&task.name, &task.command);
                result.set_failure("no result received from the worker pool");
                report.insert(result);
            }
        }
        Ok(report)
    }

    async fn run_cluster(
        &self,
        family: Arc<dyn SchedulerFamily>,
        commands: Vec<JobCommand>,
    ) -> Result<Report, HoplaError> {
        let folder = self
            .logdir
            .clone()
            .ok_or_else(|| HoplaError::config("cluster mode requires a log directory"))?;
        fs::create_dir_all(&folder)?;
        let watcher = Arc::new(StatusWatcher::new(
            family,
            Arc::clone(&self.shell),
            self.delay,
        ));
        let executor = Arc::new(ClusterExecutor::new(
            folder,
            self.params.clone(),
            watcher,
            Arc::clone(&self.shell),
        )?);
        if let Err(error) = executor.prepare().await {
            tracing::warn!(%error, "cluster preparation failed, submitting anyway");
        }

        let mut jobs = executor.jobs(commands)?;
        tracing::info!(
            jobs = jobs.len(),
            family = executor.family().name(),
            "submitting"
        );
        let mut start_errors = BTreeMap::new();
        for job in jobs.iter_mut() {
            if let Err(error) = job.start().await {
                tracing::warn!(job = %job.job_id(), %error, "could not submit");
                start_errors.insert(job.job_id().to_string(), error.to_string());
            }
        }

        let pending: Vec<&ClusterJob> = jobs
            .iter()
            .filter(|job| !start_errors.contains_key(job.job_id()))
            .collect();
        tokio::select! {
            _ = wait_all(&pending, self.poll_interval) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, cancelling the submitted jobs");
                for job in &pending {
                    if let Err(error) = job.stop().await {
                        tracing::warn!(job = %job.job_id(), %error, "could not cancel");
                    }
                }
            }
        }

        let mut report = Report::default();
        for job in &jobs {
            let result = match start_errors.get(job.job_id()) {
                Some(error) => {
                    let mut result = cluster_result(job, None).await;
                    result.set_failure(error);
                    result
                }
                None => cluster_result(job, Some(job.report().await)).await,
            };
            report.insert(result);
        }
        Ok(report)
    }
}

/// Returns once every job is done.
async fn wait_all(jobs: &[&ClusterJob], poll_interval: Duration) {
    loop {
        let mut remaining = 0;
        for job in jobs {
            if !job.done().await {
                remaining += 1;
            }
        }
        if remaining == 0 {
            return;
        }
        tracing::debug!(remaining, "waiting for cluster jobs");
        tokio::time::sleep(poll_interval).await;
    }
}

async fn cluster_result(job: &ClusterJob, report: Option<String>) -> JobResult {
    let commands = job.submission().commands();
    let mut result = JobResult::new(job.job_id(), &commands[0]);
    if let Submission::Group(commands) = job.submission() {
        result.info.insert(
            "cmd".to_string(),
            Value::from(
                commands
                    .iter()
                    .map(|command| Value::from(command.words().to_vec()))
                    .collect::<Vec<_>>(),
            ),
        );
    }
    let paths = job.paths();
    result.info.insert(
        "submission_id".to_string(),
        job.submission_id()
            .map(|id| Value::from(id.to_string()))
            .unwrap_or(Value::Null),
    );
    result.info.insert("status".to_string(), Value::from(job.status().await));
    for (key, path) in [
        ("script", paths.submission_file()),
        ("stdout", paths.stdout()),
        ("stderr", paths.stderr()),
    ] {
        result
            .info
            .insert(key.to_string(), Value::from(path.to_string_lossy().into_owned()));
    }
    if let Some(report) = report {
        result.debug.insert("report".to_string(), Value::from(report));
    }

    match job.submission_id() {
        _ if job.succeeded() => result.set_success(),
        Some(SubmissionId::Exit) => {
            result.set_failure(format!("submission failed: {}", job.submit_stderr()))
        }
        None => result.set_failure("never submitted"),
        Some(SubmissionId::Remote(_)) => result.set_failure(format!(
            "no completion marker in {}",
            paths.stdout().display()
        )),
    }
    result
}
