use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{bad_request, error_response, ok, ApiResult};
use crate::state::AppState;
use rclone_panel_backend::rclone::cli::{self, ConfigFile, ConfigValidation, ConfiguredRemote, RcloneStatus};

/// GET /api/rclone/status - rclone 安装状态
pub async fn rclone_status(State(state): State<Arc<AppState>>) -> ApiResult<RcloneStatus> {
    ok(cli::status(state.rclone_binary()).await)
}

#[derive(Debug, Serialize)]
pub struct ConfiguredRemotes {
    pub remotes: Vec<ConfiguredRemote>,
    pub count: usize,
}

/// GET /api/rclone/remotes - 从 rclone config show 读取远程存储
pub async fn configured_remotes(State(state): State<Arc<AppState>>) -> ApiResult<ConfiguredRemotes> {
    let remotes = cli::list_remotes(state.rclone_binary())
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    ok(ConfiguredRemotes { count: remotes.len(), remotes })
}

/// GET /api/rclone/config - 读取配置文件
pub async fn read_config(State(state): State<Arc<AppState>>) -> ApiResult<ConfigFile> {
    let path = cli::config_path(state.rclone_binary()).await;
    let file = cli::read_config(&path).await.map_err(|e| {
        tracing::error!("Failed to read rclone config {:?}: {}", path, e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to read rclone config: {}", e))
    })?;
    ok(file)
}

#[derive(Debug, Deserialize)]
pub struct WriteConfigReq {
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WriteConfigResult {
    pub path: String,
    pub validation: ConfigValidation,
}

/// POST /api/rclone/config - 写入配置文件并校验
pub async fn write_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WriteConfigReq>,
) -> ApiResult<WriteConfigResult> {
    let content = req.content.ok_or_else(|| bad_request("content must be a string"))?;
    let path = cli::config_path(state.rclone_binary()).await;

    cli::write_config(&path, content).await.map_err(|e| {
        tracing::error!("Failed to write rclone config {:?}: {}", path, e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to write rclone config: {}", e))
    })?;
    tracing::info!("rclone config written to {:?}", path);

    // 写入成功但校验失败时仍返回 200，由前端展示校验结果
    let validation = cli::validate_config(state.rclone_binary()).await;
    if !validation.valid {
        tracing::warn!("rclone config validation failed: {:?}", validation.error);
    }
    ok(WriteConfigResult {
        path: path.to_string_lossy().into_owned(),
        validation,
    })
}
