use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::{ok, remote_error, ApiError, ApiResponse, ApiResult};
use crate::state::AppState;
use rclone_panel_backend::remotes::{self, CreateRemoteRequest, Remote, UpdateRemoteRequest};

/// GET /api/remotes - 远程存储列表
pub async fn list_remotes(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Remote>> {
    ok(remotes::list(&state.db).await.map_err(remote_error)?)
}

/// POST /api/remotes - 新建远程存储
pub async fn create_remote(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRemoteRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Remote>>), ApiError> {
    let remote = remotes::create(&state.db, req).await.map_err(remote_error)?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(remote))))
}

/// GET /api/remotes/:id
pub async fn get_remote(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Remote> {
    ok(remotes::get(&state.db, &id).await.map_err(remote_error)?)
}

/// POST /api/remotes/:id - 更新配置
pub async fn update_remote(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRemoteRequest>,
) -> ApiResult<Remote> {
    ok(remotes::update(&state.db, &id, req).await.map_err(remote_error)?)
}

/// POST /api/remotes/:id/delete
pub async fn delete_remote(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    remotes::delete(&state.db, &id).await.map_err(remote_error)?;
    ok(json!({ "deleted": id }))
}
