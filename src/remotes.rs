//! Saved remote definitions / 远程存储配置
//!
//! Panel-side records of remotes (name, backend type, JSON config). They are
//! kept in SQLite and are independent of the rclone config file.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote not found: {0}")]
    NotFound(String),

    #[error("remote with name {0} already exists")]
    DuplicateName(String),

    #[error("invalid remote: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// 远程存储记录
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Remote {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub remote_type: String,
    /// JSON 文本
    pub config: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Remote {
    /// Config as JSON, `{}` if the stored text is unreadable
    pub fn config_value(&self) -> Value {
        serde_json::from_str(&self.config).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRemoteRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub remote_type: String,
    pub config: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRemoteRequest {
    pub config: Value,
}

/// 按创建时间倒序列出
pub async fn list(db: &SqlitePool) -> Result<Vec<Remote>, RemoteError> {
    let remotes = sqlx::query_as::<_, Remote>(
        "SELECT id, name, remote_type, config, created_at, updated_at FROM remotes ORDER BY created_at DESC, id DESC"
    )
    .fetch_all(db)
    .await?;
    Ok(remotes)
}

pub async fn get(db: &SqlitePool, id: &str) -> Result<Remote, RemoteError> {
    sqlx::query_as::<_, Remote>(
        "SELECT id, name, remote_type, config, created_at, updated_at FROM remotes WHERE id = ?"
    )
    .bind(id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| RemoteError::NotFound(id.to_string()))
}

/// 创建远程存储
pub async fn create(db: &SqlitePool, req: CreateRemoteRequest) -> Result<Remote, RemoteError> {
    let name = req.name.trim();
    let remote_type = req.remote_type.trim();
    if name.is_empty() || remote_type.is_empty() || req.config.is_null() {
        return Err(RemoteError::InvalidInput("name, type and config are required".to_string()));
    }

    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM remotes WHERE name = ?")
        .bind(name)
        .fetch_optional(db)
        .await?;
    if existing.is_some() {
        return Err(RemoteError::DuplicateName(name.to_string()));
    }

    let now = Utc::now().to_rfc3339();
    let remote = Remote {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        remote_type: remote_type.to_string(),
        config: req.config.to_string(),
        created_at: now.clone(),
        updated_at: now,
    };

    let result = sqlx::query(
        "INSERT INTO remotes (id, name, remote_type, config, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)"
    )
    .bind(&remote.id)
    .bind(&remote.name)
    .bind(&remote.remote_type)
    .bind(&remote.config)
    .bind(&remote.created_at)
    .bind(&remote.updated_at)
    .execute(db)
    .await;

    match result {
        Ok(_) => {
            tracing::info!("Created remote {} ({})", remote.name, remote.remote_type);
            Ok(remote)
        }
        // 并发创建同名时由 UNIQUE 约束兜底
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(RemoteError::DuplicateName(remote.name))
        }
        Err(e) => Err(e.into()),
    }
}

/// 更新配置
pub async fn update(db: &SqlitePool, id: &str, req: UpdateRemoteRequest) -> Result<Remote, RemoteError> {
    if req.config.is_null() {
        return Err(RemoteError::InvalidInput("config is required".to_string()));
    }
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query("UPDATE remotes SET config = ?, updated_at = ? WHERE id = ?")
        .bind(req.config.to_string())
        .bind(&now)
        .bind(id)
        .execute(db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(RemoteError::NotFound(id.to_string()));
    }
    get(db, id).await
}

pub async fn delete(db: &SqlitePool, id: &str) -> Result<(), RemoteError> {
    let result = sqlx::query("DELETE FROM remotes WHERE id = ?")
        .bind(id)
        .execute(db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(RemoteError::NotFound(id.to_string()));
    }
    tracing::info!("Deleted remote {}", id);
    Ok(())
}
