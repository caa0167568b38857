use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HoplaError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to execute local command: {0}")]
    LocalCommandError(#[from] std::io::Error),
    #[error("Command '{command}' exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("Failed to parse scheduler output: {0}")]
    SchedulerOutput(String),
    #[error("Failed to read job trace {path}: {reason}")]
    Trace { path: PathBuf, reason: String },
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to register template: {0}")]
    Template(#[from] Box<handlebars::TemplateError>),
    #[error("Failed to render template: {0}")]
    Render(#[from] handlebars::RenderError),
    #[error("Container image error: {0}")]
    Image(String),
}

impl HoplaError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the error comes from invalid input rather than from the environment.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl From<handlebars::TemplateError> for HoplaError {
    fn from(error: handlebars::TemplateError) -> Self {
        Self::Template(Box::new(error))
    }
}
