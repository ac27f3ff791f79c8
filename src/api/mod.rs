pub mod rc;
pub mod rclone;
pub mod remotes;
pub mod server;
pub mod tasks;

use axum::{http::StatusCode, Json};
use serde::Serialize;
use serde_json::{json, Value};

use rclone_panel_backend::error::TaskError;
use rclone_panel_backend::rclone::RcError;
use rclone_panel_backend::remotes::RemoteError;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 200,
            message: "success".to_string(),
            data: Some(data),
        }
    }
}

/// Error half of every handler result / 接口错误响应
pub type ApiError = (StatusCode, Json<Value>);

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

pub fn error_response(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(json!({
            "code": status.as_u16(),
            "message": message.to_string()
        })),
    )
}

pub fn bad_request(message: impl std::fmt::Display) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, message)
}

/// 任务错误 → HTTP 状态码
pub fn task_error(e: TaskError) -> ApiError {
    let status = match &e {
        TaskError::NotFound(_) => StatusCode::NOT_FOUND,
        TaskError::AlreadyRunning(_) | TaskError::Conflict { .. } => StatusCode::CONFLICT,
        TaskError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        TaskError::ProcessLaunch(_) | TaskError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Task request failed: {}", e);
    }
    error_response(status, e)
}

pub fn rc_error(e: RcError) -> ApiError {
    match e {
        RcError::Rejected(message) => bad_request(message),
        other => {
            tracing::warn!("rc request failed: {}", other);
            error_response(StatusCode::BAD_GATEWAY, other)
        }
    }
}

pub fn remote_error(e: RemoteError) -> ApiError {
    let status = match &e {
        RemoteError::NotFound(_) => StatusCode::NOT_FOUND,
        RemoteError::DuplicateName(_) => StatusCode::CONFLICT,
        RemoteError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        RemoteError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e)
}
