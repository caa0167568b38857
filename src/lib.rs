//! Hopla: run a batch of commands on a local worker pool or on a cluster.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to parse and represent jobs.
pub mod job;
// Command lines from structured parameters.
pub mod converter;
// Running one job locally.
pub mod executor;
// Local worker pool.
pub mod pool;
// External command runner.
pub mod shell;
// Scheduler families (PBS, CCC).
pub mod family;
// File locations of cluster jobs.
pub mod paths;
// Shared, rate-limited status poller.
pub mod watcher;
// Cluster job lifecycle.
pub mod cluster;
// Top-level orchestration.
pub mod scheduler;

pub use cluster::{ClusterExecutor, ClusterJob, Submission, SubmissionId};
pub use config::{ClusterParameters, Config, Mode};
pub use error::HoplaError;
pub use executor::{JobExecutor, ProcessExecutor, Trace};
pub use family::{Ccc, Pbs, SchedulerFamily};
pub use job::{JobCommand, JobFile, JobResult, Task};
pub use paths::JobPaths;
pub use pool::{PoolMessage, PoolOutcome, WorkerPool};
pub use scheduler::{Report, Scheduler};
pub use shell::{LocalShell, Shell};
pub use watcher::StatusWatcher;
