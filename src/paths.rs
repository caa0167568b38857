//! File locations of a cluster job.
//!
//! All jobs of one run share a base folder holding `submissions/` and
//! `logs/`. The first [`JobPaths`] built for a folder in this process wipes
//! both directories, so nothing from a previous run survives.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use crate::error::HoplaError;

fn reset_folders() -> &'static Mutex<HashSet<PathBuf>> {
    static RESET: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    RESET.get_or_init(|| Mutex::new(HashSet::new()))
}

#[derive(Debug, Clone)]
pub struct JobPaths {
    submission_folder: PathBuf,
    log_folder: PathBuf,
    job_id: String,
}

impl JobPaths {
    pub fn new(folder: &Path, job_id: &str) -> Result<Self, HoplaError> {
        let submission_folder = folder.join("submissions");
        let log_folder = folder.join("logs");
        std::fs::create_dir_all(folder)?;
        // Spellings of the same folder share one reset.
        let key = folder.canonicalize()?;
        {
            let mut reset = reset_folders()
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if reset.insert(key) {
                for dir in [&submission_folder, &log_folder] {
                    if dir.exists() {
                        std::fs::remove_dir_all(dir)?;
                    }
                }
            }
        }
        std::fs::create_dir_all(&submission_folder)?;
        std::fs::create_dir_all(&log_folder)?;
        Ok(Self {
            submission_folder,
            log_folder,
            job_id: job_id.to_string(),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn submission_file(&self) -> PathBuf {
        self.submission_folder
            .join(format!("{}_submission.sh", self.job_id))
    }

    pub fn stdout(&self) -> PathBuf {
        self.log_folder.join(format!("{}_log.out", self.job_id))
    }

    pub fn stderr(&self) -> PathBuf {
        self.log_folder.join(format!("{}_log.err", self.job_id))
    }

    /// Task list of a multi-task job.
    pub fn task_file(&self) -> PathBuf {
        self.submission_folder
            .join(format!("{}_tasks.txt", self.job_id))
    }

    /// Wrapper running each task of a multi-task job.
    pub fn worker_file(&self) -> PathBuf {
        self.submission_folder.join("worker.sh")
    }

    /// Per-task logs of a multi-task job.
    pub fn task_log_dir(&self) -> PathBuf {
        self.log_folder.join(format!("{}_tasks", self.job_id))
    }
}
