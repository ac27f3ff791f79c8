use thiserror::Error;

use crate::task::TaskStatus;

/// Task lifecycle errors / 任务生命周期错误
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {0} already has a running handle")]
    AlreadyRunning(String),

    #[error("cannot {action} a task in status {status}")]
    Conflict {
        action: &'static str,
        status: TaskStatus,
    },

    #[error("failed to launch rclone: {0}")]
    ProcessLaunch(String),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
