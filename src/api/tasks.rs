use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::api::{ok, task_error, ApiError, ApiResult};
use crate::state::AppState;
use rclone_panel_backend::error::TaskError;
use rclone_panel_backend::task::{
    CancelOutcome, Executor, ProgressSnapshot, Task, TaskFilter, TaskKind, TaskOptions, TaskStatus,
};

/// 任务列表查询参数
#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<TaskStatus>,
    #[serde(alias = "type")]
    pub kind: Option<TaskKind>,
}

/// GET /api/tasks - 获取任务列表（最新的在前）
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Vec<Task>> {
    let filter = TaskFilter { status: query.status, kind: query.kind };
    ok(state.task_manager.list_tasks(filter).await)
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskReq {
    #[serde(alias = "type")]
    pub kind: TaskKind,
    #[serde(alias = "src")]
    pub source: String,
    #[serde(alias = "dst")]
    pub destination: String,
    #[serde(default)]
    pub options: TaskOptions,
    #[serde(default)]
    pub executor: Executor,
    /// 创建后立即启动（默认 true）
    #[serde(default = "default_start")]
    pub start: bool,
}

fn default_start() -> bool {
    true
}

/// POST /api/tasks/create - 创建并启动任务
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskReq>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let manager = &state.task_manager;
    let task = manager
        .create_task(req.kind, &req.source, &req.destination, req.options, req.executor)
        .await
        .map_err(task_error)?;

    if !req.start {
        return Ok((StatusCode::CREATED, Json(json!({ "code": 201, "data": task }))));
    }

    match manager.start_task(&task.id).await {
        Ok(task) => Ok((StatusCode::CREATED, Json(json!({ "code": 201, "data": task })))),
        // 启动失败时任务已记录为 failed，一并返回
        Err(TaskError::ProcessLaunch(message)) => {
            let task = manager.get_task(&task.id).await.map_err(task_error)?;
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "code": 500, "message": message, "data": task })),
            ))
        }
        Err(e) => Err(task_error(e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct TaskIdReq {
    #[serde(alias = "id")]
    pub task_id: String,
}

/// POST /api/tasks/get - 获取单个任务
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdReq>,
) -> ApiResult<Task> {
    ok(state.task_manager.get_task(&req.task_id).await.map_err(task_error)?)
}

/// POST /api/tasks/progress - 进度快照
pub async fn get_task_progress(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdReq>,
) -> ApiResult<ProgressSnapshot> {
    ok(state.task_manager.get_task_progress(&req.task_id).await.map_err(task_error)?)
}

/// POST /api/tasks/cancel - 取消任务
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdReq>,
) -> ApiResult<CancelOutcome> {
    ok(state.task_manager.cancel_task(&req.task_id).await.map_err(task_error)?)
}

/// POST /api/tasks/pause - 暂停任务
pub async fn pause_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdReq>,
) -> ApiResult<Task> {
    ok(state.task_manager.pause_task(&req.task_id).await.map_err(task_error)?)
}

/// POST /api/tasks/resume - 恢复任务
pub async fn resume_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdReq>,
) -> ApiResult<Task> {
    ok(state.task_manager.resume_task(&req.task_id).await.map_err(task_error)?)
}

/// POST /api/tasks/retry - 以新任务重试
pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdReq>,
) -> ApiResult<Task> {
    ok(state.task_manager.retry_task(&req.task_id).await.map_err(task_error)?)
}

/// POST /api/tasks/remove - 删除已结束的任务
pub async fn remove_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskIdReq>,
) -> ApiResult<Value> {
    state.task_manager.remove_task(&req.task_id).await.map_err(task_error)?;
    ok(json!({ "removed": req.task_id }))
}

#[derive(Debug, Serialize)]
pub struct ClearResult {
    pub cleared: usize,
}

/// POST /api/tasks/clear - 清除所有已结束的任务
pub async fn clear_finished(State(state): State<Arc<AppState>>) -> ApiResult<ClearResult> {
    let cleared = state.task_manager.clear_finished().await.map_err(task_error)?;
    ok(ClearResult { cleared })
}

/// GET /api/tasks/events - SSE 推送任务事件
pub async fn task_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.task_manager.subscribe()).filter_map(|item| async move {
        match item {
            Ok(event) => match Event::default().event("task").json_data(&event) {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    tracing::warn!("Failed to encode task event: {}", e);
                    None
                }
            },
            // 客户端跟不上时丢弃旧事件，提示其重新拉取列表
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                Some(Ok(Event::default().event("lagged").data(skipped.to_string())))
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

