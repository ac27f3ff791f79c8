use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::models::Task;

/// 任务类型 / Transfer kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[serde(alias = "download", alias = "upload")]
    Copy,
    Sync,
    Move,
}

impl TaskKind {
    /// rclone 子命令名
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Copy => "copy",
            TaskKind::Sync => "sync",
            TaskKind::Move => "move",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // 下载/上传在 rclone 中都是 copy
            "copy" | "download" | "upload" => Ok(TaskKind::Copy),
            "sync" => Ok(TaskKind::Sync),
            "move" => Ok(TaskKind::Move),
            other => Err(format!("unknown task kind: {}", other)),
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// 终态：completed / failed / cancelled，之后不再变更
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// 执行方式：一次性子进程，或委托给 rclone rc 服务器
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Executor {
    #[default]
    Process,
    Rc,
}

impl Executor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Executor::Process => "process",
            Executor::Rc => "rc",
        }
    }
}

impl FromStr for Executor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(Executor::Process),
            "rc" => Ok(Executor::Rc),
            other => Err(format!("unknown executor: {}", other)),
        }
    }
}

/// 任务事件（用于 SSE 推送）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskCreated { task: Task },
    TaskUpdated { task: Task },
    TaskCompleted { task: Task },
    TaskFailed { task: Task },
    TaskCancelled { task: Task },
    TaskRemoved { task_id: String },
}

impl TaskEvent {
    /// Pick the event variant matching the task's current status / 按状态选择事件类型
    pub fn for_task(task: &Task) -> Self {
        let task = task.clone();
        match task.status {
            TaskStatus::Completed => TaskEvent::TaskCompleted { task },
            TaskStatus::Failed => TaskEvent::TaskFailed { task },
            TaskStatus::Cancelled => TaskEvent::TaskCancelled { task },
            _ => TaskEvent::TaskUpdated { task },
        }
    }
}

/// Structured progress parsed from one summary line or one stats poll / 单次进度数据
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressUpdate {
    pub transferred_bytes: u64,
    /// 0 = unknown
    pub total_bytes: u64,
    /// `None` when the rate could not be parsed
    pub speed_bytes_per_sec: Option<u64>,
    pub eta_seconds: Option<u64>,
    pub current_file: Option<String>,
    pub raw_line: Option<String>,
}

/// Progress event payload / 进度事件内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEventKind {
    /// Non-terminal transfer progress
    Progress(ProgressUpdate),
    /// A line from the error stream, kept verbatim
    Error { raw_line: String, fatal: bool },
    /// The process exited or the RC job finished. `exit_code` is `None` when the
    /// process was signalled or contact with the job was lost.
    Exited { exit_code: Option<i32>, message: Option<String> },
}

/// Ephemeral event consumed once by the reconciliation loop / 进度事件（不持久化）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub task_id: String,
    pub kind: ProgressEventKind,
}

impl ProgressEvent {
    pub fn progress(task_id: impl Into<String>, update: ProgressUpdate) -> Self {
        Self { task_id: task_id.into(), kind: ProgressEventKind::Progress(update) }
    }

    pub fn error(task_id: impl Into<String>, raw_line: impl Into<String>, fatal: bool) -> Self {
        Self {
            task_id: task_id.into(),
            kind: ProgressEventKind::Error { raw_line: raw_line.into(), fatal },
        }
    }

    pub fn exited(task_id: impl Into<String>, exit_code: Option<i32>, message: Option<String>) -> Self {
        Self {
            task_id: task_id.into(),
            kind: ProgressEventKind::Exited { exit_code, message },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ProgressEventKind::Exited { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ProgressEventKind::Error { .. })
    }
}
