//! Configuration for Hopla.
//!
//! Holds the clap structs for command line arguments and flags, and the
//! cluster resource parameters which can also come from a YAML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::HoplaError;

#[derive(Parser, Debug)]
#[command(version, author, about)]
pub struct Config {
    /// YAML job file listing the commands to run
    pub job_file: PathBuf,

    /// Run locally (local), or submit to a PBS (pbs) or CCC/Slurm (ccc) cluster
    #[arg(long, short, value_enum, default_value = "local")]
    pub mode: Mode,

    /// (Local mode) Number of concurrent workers
    #[arg(long, short, default_value = "1")]
    pub cpus: usize,

    /// Where to write status.json and exitcodes.json
    #[arg(long, short)]
    pub outputdir: Option<PathBuf>,

    /// (Cluster mode) Empty folder receiving submission scripts and logs
    #[arg(long)]
    pub logdir: Option<PathBuf>,

    /// (Cluster mode) YAML file with the cluster resource parameters
    #[arg(long)]
    pub cluster_config: Option<PathBuf>,

    /// (Cluster mode) Queue the jobs are submitted to
    #[arg(long)]
    pub queue: Option<String>,

    /// (Cluster mode) Walltime of each job, in hours
    #[arg(long)]
    pub walltime: Option<f64>,

    /// (Cluster mode) Memory of each job, in GB
    #[arg(long)]
    pub memory: Option<f64>,

    /// (CCC mode) Container image name or docker archive
    #[arg(long)]
    pub image: Option<String>,

    /// (Cluster mode) Minimum number of seconds between two status queries
    #[arg(long, default_value = "60")]
    pub delay_s: u64,

    /// (Cluster mode) Number of seconds between two completion checks
    #[arg(long, default_value = "5")]
    pub poll_interval: u64,

    /// Also write log messages to this file
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Config {
    /// Cluster parameters from `--cluster-config`, overridden by the flags.
    pub fn cluster_parameters(&self) -> Result<ClusterParameters, HoplaError> {
        let mut params = match &self.cluster_config {
            Some(path) => ClusterParameters::load(path)?,
            None => ClusterParameters::default(),
        };
        if let Some(queue) = &self.queue {
            params.queue = Some(queue.clone());
        }
        if let Some(walltime) = self.walltime {
            params.walltime = walltime;
        }
        if let Some(memory) = self.memory {
            params.memory = memory;
        }
        if let Some(image) = &self.image {
            params.image = Some(image.clone());
        }
        Ok(params)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, ValueEnum)]
pub enum Mode {
    #[value(name = "local")]
    Local,
    #[value(name = "pbs")]
    Pbs,
    #[value(name = "ccc")]
    Ccc,
}

/// Resources requested for every cluster job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParameters {
    pub queue: Option<String>,
    /// Hours.
    pub walltime: f64,
    /// GB.
    pub memory: f64,
    pub ncpus: usize,
    pub ngpus: usize,
    /// Accounting project.
    pub project: Option<String>,
    /// Environment modules loaded before running the command.
    pub modules: Vec<String>,
    /// Container image name, or path to a docker archive.
    pub image: Option<String>,
    /// Container hub the image is looked up in.
    pub hub: String,
    /// Cores given to each task of a multi-task job.
    pub nmulticpus: usize,
    /// Commands per submission. Above 1, commands are grouped into multi-task jobs.
    pub group_size: usize,
}

impl Default for ClusterParameters {
    fn default() -> Self {
        Self {
            queue: None,
            walltime: 72.0,
            memory: 2.0,
            ncpus: 1,
            ngpus: 0,
            project: None,
            modules: vec![],
            image: None,
            hub: "n4h00001rs".to_string(),
            nmulticpus: 1,
            group_size: 1,
        }
    }
}

impl ClusterParameters {
    pub fn load(path: &Path) -> Result<Self, HoplaError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn walltime_seconds(&self) -> u64 {
        (self.walltime * 3600.0).round() as u64
    }

    pub fn memory_megabytes(&self) -> u64 {
        (self.memory * 1000.0).round() as u64
    }

    /// The `module load` line, empty when no module is requested.
    pub fn module_line(&self) -> String {
        if self.modules.is_empty() {
            String::new()
        } else {
            format!("module load {}", self.modules.join(" "))
        }
    }
}
