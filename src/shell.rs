//! Runs the external scheduler commands (submit, status, cancel, image tools).
//!
//! Everything that talks to a cluster goes through the [`Shell`] trait so that
//! a mock can stand in for `qsub`, `squeue` and friends.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use itertools::Itertools;
use tokio::process::Command;

use crate::error::HoplaError;

#[async_trait]
pub trait Shell: Send + Sync {
    /// Runs `program` with `args` to completion and captures its output.
    async fn run(&self, program: &str, args: &[String]) -> Result<Output, HoplaError>;

    /// Like [`Shell::run`], but a non-zero exit status is an error.
    async fn check_output(&self, program: &str, args: &[String]) -> Result<String, HoplaError> {
        let output = self.run(program, args).await?;
        if !output.status.success() {
            return Err(HoplaError::CommandFailed {
                command: display_command(program, args),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Runs commands as subprocesses of this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalShell;

#[async_trait]
impl Shell for LocalShell {
    async fn run(&self, program: &str, args: &[String]) -> Result<Output, HoplaError> {
        tracing::debug!(command = %display_command(program, args), "running");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }
}

pub fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program).chain(args.iter().map(String::as_str)).join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_shell_captures_stdout() {
        let output = LocalShell
            .check_output("sh", &["-c".to_string(), "echo hello".to_string()])
            .await
            .unwrap();
        assert_eq!(output, "hello\n");
    }

    #[tokio::test]
    async fn test_check_output_reports_failure() {
        let err = LocalShell
            .check_output("sh", &["-c".to_string(), "echo oops >&2; exit 3".to_string()])
            .await
            .unwrap_err();
        match err {
            HoplaError::CommandFailed { stderr, .. } => assert_eq!(stderr, "oops"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        assert!(LocalShell
            .run("/nonexistent/hopla-test-binary", &[])
            .await
            .is_err());
    }
}
