use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::types::{Executor, TaskKind, TaskStatus};

/// 传输选项（对应 rclone 命令行参数）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub checkers: Option<u32>,
    #[serde(default)]
    pub transfers: Option<u32>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub include: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub exclude: Vec<String>,
    /// Bandwidth limit passed through to `--bwlimit` (e.g. `10M`)
    #[serde(default)]
    pub bwlimit: Option<String>,
}

/// Accept either a single filter pattern or a list / 兼容单个字符串或数组
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) if s.trim().is_empty() => Vec::new(),
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v.into_iter().filter(|s| !s.trim().is_empty()).collect(),
        OneOrMany::Null(_) => Vec::new(),
    })
}

/// 任务信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub source: String,
    pub destination: String,
    pub executor: Executor,
    pub options: TaskOptions,
    pub status: TaskStatus,
    pub progress_bytes: u64,
    /// 0 = unknown
    pub total_bytes: u64,
    /// bytes/s, 0 unless running
    pub speed: u64,
    pub eta_seconds: Option<u64>,
    pub current_file: Option<String>,
    pub error_message: Option<String>,
    /// 最近一条 stderr 输出
    pub last_output: Option<String>,
    pub rc_job_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_saved: Option<DateTime<Utc>>,  // 上次保存时间（不序列化）
}

impl Task {
    pub fn new(
        kind: TaskKind,
        source: String,
        destination: String,
        options: TaskOptions,
        executor: Executor,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source,
            destination,
            executor,
            options,
            status: TaskStatus::Pending,
            progress_bytes: 0,
            total_bytes: 0,
            speed: 0,
            eta_seconds: None,
            current_file: None,
            error_message: None,
            last_output: None,
            rc_job_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            last_saved: None,
        }
    }

    /// 进度百分比（总大小未知时为 None）
    pub fn percent(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        Some((self.progress_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0))
    }
}

/// Read-only progress view handed to polling clients / 进度快照
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress_bytes: u64,
    pub total_bytes: u64,
    pub percent: Option<f64>,
    pub speed: u64,
    pub eta_seconds: Option<u64>,
    pub current_file: Option<String>,
    pub error_message: Option<String>,
    pub last_output: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for ProgressSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            progress_bytes: task.progress_bytes,
            total_bytes: task.total_bytes,
            percent: task.percent(),
            speed: task.speed,
            eta_seconds: task.eta_seconds,
            current_file: task.current_file.clone(),
            error_message: task.error_message.clone(),
            last_output: task.last_output.clone(),
            updated_at: task.updated_at,
        }
    }
}

/// 取消结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub accepted: bool,
    pub handle_was_running: bool,
}
