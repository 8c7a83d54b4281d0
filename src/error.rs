use std::time::Duration;

use thiserror::Error;

use crate::task::TaskId;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to submit task: {0}")]
    Submission(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("No active session for job {0}")]
    NoActiveSession(String),
    #[error("Failed to poll job {job}: {reason}")]
    Poll { job: String, reason: String },
    #[error("No bytes received for {0:?}, transfer aborted")]
    TransferTimeout(Duration),
    #[error("Transfer cancelled")]
    TransferCancelled,
    #[error("Unknown component '{0}'")]
    UnknownComponent(String),
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    SshError(#[from] openssh::Error),
    #[error("Failed to execute local command: {0}")]
    LocalCommandError(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to (de)serialize internal state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to render command template: {0}")]
    Render(#[from] handlebars::RenderError),
    #[error("Failed to register command template: {0}")]
    Template(#[from] handlebars::TemplateError),
}

pub type Result<T> = std::result::Result<T, ExecError>;
