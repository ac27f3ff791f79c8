use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::api::{bad_request, error_response, ok, rc_error, ApiResult};
use crate::state::AppState;
use rclone_panel_backend::rclone::rc::{JobStatus, RcApi, TransferStats};
use rclone_panel_backend::rclone::server::RcServerStatus;

/// GET /api/rc/status - rc 服务是否在线
pub async fn rc_status(State(state): State<Arc<AppState>>) -> ApiResult<RcServerStatus> {
    ok(state.rc_server.status().await)
}

/// POST /api/rc/start - 启动 rclone rcd
pub async fn rc_start(State(state): State<Arc<AppState>>) -> ApiResult<RcServerStatus> {
    let status = state
        .rc_server
        .start()
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    ok(status)
}

/// POST /api/rc/stop
pub async fn rc_stop(State(state): State<Arc<AppState>>) -> ApiResult<RcServerStatus> {
    state.rc_server.stop().await.map_err(|e| error_response(StatusCode::CONFLICT, e))?;
    ok(state.rc_server.status().await)
}

/// POST /api/rc/restart
pub async fn rc_restart(State(state): State<Arc<AppState>>) -> ApiResult<RcServerStatus> {
    let status = state
        .rc_server
        .restart()
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    ok(status)
}

/// GET /api/rc/stats - 全局传输统计
pub async fn rc_stats(State(state): State<Arc<AppState>>) -> ApiResult<TransferStats> {
    ok(state.rc.global_stats().await.map_err(rc_error)?)
}

/// GET /api/rc/jobs - 作业列表
pub async fn rc_jobs(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    ok(state.rc.job_list().await.map_err(rc_error)?)
}

#[derive(Debug, Deserialize)]
pub struct JobReq {
    #[serde(alias = "jobid")]
    pub job_id: i64,
}

/// POST /api/rc/job - 单个作业状态
pub async fn rc_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JobReq>,
) -> ApiResult<JobStatus> {
    ok(state.rc.job_status(req.job_id).await.map_err(rc_error)?)
}

/// GET /api/rc/bwlimit
pub async fn get_bwlimit(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    ok(state.rc.get_bwlimit().await.map_err(rc_error)?)
}

#[derive(Debug, Deserialize)]
pub struct BwLimitReq {
    pub rate: String,
}

/// POST /api/rc/bwlimit - 设置全局带宽限制
pub async fn set_bwlimit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BwLimitReq>,
) -> ApiResult<Value> {
    let result = state.rc.set_bwlimit(&req.rate).await.map_err(rc_error)?;
    tracing::info!("rc bandwidth limit set to {}", req.rate.trim());
    ok(result)
}

#[derive(Debug, Deserialize)]
pub struct CallReq {
    pub endpoint: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// POST /api/rc/call - 通用 rc 代理
pub async fn rc_call(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CallReq>,
) -> ApiResult<Value> {
    let params = match req.params {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(params @ Value::Object(_)) => params,
        Some(_) => return Err(bad_request("params must be an object")),
    };
    ok(state.rc.call(&req.endpoint, params).await.map_err(rc_error)?)
}
