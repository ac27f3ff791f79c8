//! Task state store / 任务状态存储
//!
//! Every task lives behind its own async mutex, so updates to one task are
//! serialized while different tasks never contend. SQLite is written through on
//! each committed change and read only at startup.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::models::{Task, TaskOptions};
use super::types::{Executor, TaskKind, TaskStatus};
use crate::error::{Result, TaskError};

type Entry = Arc<Mutex<Task>>;

/// 任务存储
pub struct TaskStore {
    db: SqlitePool,
    tasks: RwLock<HashMap<String, Entry>>,
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_task(row: &SqliteRow) -> std::result::Result<Task, String> {
    let id: String = row.try_get("id").map_err(|e| e.to_string())?;
    let kind: String = row.try_get("kind").map_err(|e| e.to_string())?;
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    let executor: String = row.try_get("executor").map_err(|e| e.to_string())?;
    let options: String = row.try_get("options").map_err(|e| e.to_string())?;
    let created_at: String = row.try_get("created_at").map_err(|e| e.to_string())?;
    let updated_at: String = row.try_get("updated_at").map_err(|e| e.to_string())?;
    let started_at: Option<String> = row.try_get("started_at").ok().flatten();
    let finished_at: Option<String> = row.try_get("finished_at").ok().flatten();

    let created_at = parse_time(&created_at).ok_or_else(|| format!("bad created_at for task {}", id))?;

    Ok(Task {
        kind: kind.parse::<TaskKind>()?,
        status: status.parse::<TaskStatus>()?,
        executor: executor.parse::<Executor>()?,
        options: serde_json::from_str::<TaskOptions>(&options).unwrap_or_default(),
        source: row.try_get("source").map_err(|e| e.to_string())?,
        destination: row.try_get("destination").map_err(|e| e.to_string())?,
        progress_bytes: row.get::<i64, _>("progress_bytes").max(0) as u64,
        total_bytes: row.get::<i64, _>("total_bytes").max(0) as u64,
        speed: row.get::<i64, _>("speed").max(0) as u64,
        eta_seconds: row.get::<Option<i64>, _>("eta_seconds").map(|s| s.max(0) as u64),
        current_file: row.try_get("current_file").ok().flatten(),
        error_message: row.try_get("error_message").ok().flatten(),
        last_output: row.try_get("last_output").ok().flatten(),
        rc_job_id: row.try_get("rc_job_id").ok().flatten(),
        updated_at: parse_time(&updated_at).unwrap_or(created_at),
        created_at,
        started_at: started_at.as_deref().and_then(parse_time),
        finished_at: finished_at.as_deref().and_then(parse_time),
        last_saved: None,
        id,
    })
}

impl TaskStore {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Load all persisted tasks into memory / 从数据库加载任务
    pub async fn load(&self) -> Result<usize> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC")
            .fetch_all(&self.db)
            .await?;

        let mut tasks = self.tasks.write().await;
        for row in rows {
            match row_to_task(&row) {
                Ok(task) => {
                    tasks.insert(task.id.clone(), Arc::new(Mutex::new(task)));
                }
                Err(e) => tracing::warn!("Skipping unreadable task row: {}", e),
            }
        }
        tracing::info!("Loaded {} tasks from database", tasks.len());
        Ok(tasks.len())
    }

    /// 保存任务到数据库
    pub async fn save(&self, task: &Task) -> Result<()> {
        let options = serde_json::to_string(&task.options)
            .map_err(|e| TaskError::InvalidInput(e.to_string()))?;

        sqlx::query(
            r#"INSERT OR REPLACE INTO tasks
               (id, kind, source, destination, executor, options, status,
                progress_bytes, total_bytes, speed, eta_seconds, current_file,
                error_message, last_output, rc_job_id, created_at, updated_at,
                started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#
        )
        .bind(&task.id)
        .bind(task.kind.as_str())
        .bind(&task.source)
        .bind(&task.destination)
        .bind(task.executor.as_str())
        .bind(options)
        .bind(task.status.as_str())
        .bind(task.progress_bytes as i64)
        .bind(task.total_bytes as i64)
        .bind(task.speed as i64)
        .bind(task.eta_seconds.map(|s| s as i64))
        .bind(&task.current_file)
        .bind(&task.error_message)
        .bind(&task.last_output)
        .bind(task.rc_job_id)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Persist a new task, then make it visible / 新增任务
    pub async fn insert(&self, mut task: Task) -> Result<Task> {
        self.save(&task).await?;
        task.last_saved = Some(Utc::now());
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.clone(), Arc::new(Mutex::new(task.clone())));
        Ok(task)
    }

    /// Take the per-task lock / 获取任务锁
    pub async fn lock(&self, task_id: &str) -> Result<OwnedMutexGuard<Task>> {
        let entry = {
            let tasks = self.tasks.read().await;
            tasks.get(task_id).cloned()
        };
        match entry {
            Some(entry) => Ok(entry.lock_owned().await),
            None => Err(TaskError::NotFound(task_id.to_string())),
        }
    }

    /// Consistent snapshot of one task / 获取任务快照
    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.lock(task_id).await.ok().map(|task| task.clone())
    }

    /// All tasks, newest first / 按创建时间倒序列出
    pub async fn list(&self) -> Vec<Task> {
        let entries: Vec<Entry> = {
            let tasks = self.tasks.read().await;
            tasks.values().cloned().collect()
        };

        let mut list = Vec::with_capacity(entries.len());
        for entry in entries {
            list.push(entry.lock().await.clone());
        }
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        list
    }

    /// Delete from database and memory / 删除任务
    pub async fn remove(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.db)
            .await?;
        let removed = self.tasks.write().await.remove(task_id).is_some();
        Ok(removed || result.rows_affected() > 0)
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }
}
