//! rclone remote-control (RC) HTTP client / rclone RC 接口客户端

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::RcloneConfig;
use crate::task::{ProgressUpdate, TaskKind, TaskOptions};

static ENDPOINT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_/-]+$").unwrap());

/// RC call errors / RC 调用错误
#[derive(Debug, Error)]
pub enum RcError {
    #[error("rc request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("rc returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rc request rejected: {0}")]
    Rejected(String),

    #[error("invalid rc response: {0}")]
    Decode(String),
}

/// `job/status` response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobStatus {
    pub id: i64,
    pub group: String,
    pub finished: bool,
    pub success: bool,
    pub error: String,
    /// seconds
    pub duration: f64,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

/// Entry of `transferring` in `core/stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferringFile {
    pub name: String,
    pub size: i64,
    pub bytes: i64,
    pub percentage: Option<u32>,
}

/// `core/stats` response (global or per group) / 传输统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferStats {
    pub bytes: u64,
    pub total_bytes: u64,
    /// bytes/s
    pub speed: f64,
    pub transfers: u64,
    pub total_transfers: u64,
    pub errors: u64,
    pub checks: u64,
    pub eta: Option<f64>,
    pub elapsed_time: f64,
    pub last_error: Option<String>,
    pub transferring: Vec<TransferringFile>,
}

impl TransferStats {
    /// 转换为进度数据
    pub fn to_update(&self) -> ProgressUpdate {
        ProgressUpdate {
            transferred_bytes: self.bytes,
            total_bytes: self.total_bytes,
            speed_bytes_per_sec: (self.speed.is_finite() && self.speed >= 0.0).then(|| self.speed as u64),
            eta_seconds: self.eta.filter(|eta| eta.is_finite() && *eta >= 0.0).map(|eta| eta as u64),
            current_file: self.transferring.first().map(|f| f.name.clone()).filter(|n| !n.is_empty()),
            raw_line: None,
        }
    }
}

/// Operations the task pipeline needs from the RC server / 任务流程依赖的 RC 操作
#[async_trait]
pub trait RcApi: Send + Sync {
    /// Start an async `sync/<kind>` job and return its id / 提交异步传输作业
    async fn start_job(
        &self,
        kind: TaskKind,
        source: &str,
        destination: &str,
        options: &TaskOptions,
    ) -> Result<i64, RcError>;

    async fn job_status(&self, job_id: i64) -> Result<JobStatus, RcError>;

    async fn job_stats(&self, job_id: i64) -> Result<TransferStats, RcError>;

    async fn stop_job(&self, job_id: i64) -> Result<(), RcError>;
}

/// Reject anything that is not a plain `area/name` path / 校验 RC 接口路径
pub fn validate_endpoint(endpoint: &str) -> Result<&str, RcError> {
    let trimmed = endpoint.trim().trim_matches('/');
    if trimmed.is_empty() || trimmed.contains("..") || !ENDPOINT_RE.is_match(trimmed) {
        return Err(RcError::Rejected(format!("invalid endpoint: {:?}", endpoint)));
    }
    Ok(trimmed)
}

/// rclone `_config` overrides for an async job
fn job_config(options: &TaskOptions) -> Value {
    let mut config = serde_json::Map::new();
    if options.dry_run {
        config.insert("DryRun".into(), json!(true));
    }
    if let Some(checkers) = options.checkers {
        config.insert("Checkers".into(), json!(checkers));
    }
    if let Some(transfers) = options.transfers {
        config.insert("Transfers".into(), json!(transfers));
    }
    Value::Object(config)
}

/// rclone `_filter` overrides for an async job
fn job_filter(options: &TaskOptions) -> Value {
    let mut filter = serde_json::Map::new();
    if !options.include.is_empty() {
        filter.insert("IncludeRule".into(), json!(options.include));
    }
    if !options.exclude.is_empty() {
        filter.insert("ExcludeRule".into(), json!(options.exclude));
    }
    Value::Object(filter)
}

/// RC 客户端
#[derive(Debug, Clone)]
pub struct RcClient {
    client: reqwest::Client,
    base_url: String,
    user: Option<String>,
    pass: Option<String>,
}

impl RcClient {
    pub fn new(config: &RcloneConfig) -> Result<Self, RcError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.rc_url(),
            user: config.rc_user.clone().filter(|u| !u.is_empty()),
            pass: config.rc_pass.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body to an RC endpoint / 调用 RC 接口
    pub async fn call(&self, endpoint: &str, body: Value) -> Result<Value, RcError> {
        let endpoint = validate_endpoint(endpoint)?;
        let url = format!("{}/{}", self.base_url, endpoint);

        let mut request = self.client.post(&url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.pass.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            // rclone 错误体形如 {"error": "...", "status": 500}
            let body = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(text);
            return Err(RcError::Status { status: status.as_u16(), body });
        }

        if text.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text).map_err(|e| RcError::Decode(format!("{}: {}", endpoint, e)))
    }

    async fn call_as<T: serde::de::DeserializeOwned>(&self, endpoint: &str, body: Value) -> Result<T, RcError> {
        let value = self.call(endpoint, body).await?;
        serde_json::from_value(value).map_err(|e| RcError::Decode(format!("{}: {}", endpoint, e)))
    }

    /// Whether the RC server answers `core/pid` / 检查 RC 服务是否在线
    pub async fn is_running(&self) -> bool {
        match self.call("core/pid", json!({})).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("rc server not reachable at {}: {}", self.base_url, e);
                false
            }
        }
    }

    pub async fn global_stats(&self) -> Result<TransferStats, RcError> {
        self.call_as("core/stats", json!({})).await
    }

    pub async fn job_list(&self) -> Result<Value, RcError> {
        self.call("job/list", json!({})).await
    }

    pub async fn get_bwlimit(&self) -> Result<Value, RcError> {
        self.call("core/bwlimit", json!({})).await
    }

    /// Set the global bandwidth limit (`"10M"`, `"off"`) / 设置全局带宽限制
    pub async fn set_bwlimit(&self, rate: &str) -> Result<Value, RcError> {
        let rate = rate.trim();
        if rate.is_empty() {
            return Err(RcError::Rejected("rate is required".to_string()));
        }
        self.call("core/bwlimit", json!({ "rate": rate })).await
    }
}

#[async_trait]
impl RcApi for RcClient {
    async fn start_job(
        &self,
        kind: TaskKind,
        source: &str,
        destination: &str,
        options: &TaskOptions,
    ) -> Result<i64, RcError> {
        let mut body = json!({
            "srcFs": source,
            "dstFs": destination,
            "_async": true,
        });
        let config = job_config(options);
        if config.as_object().is_some_and(|c| !c.is_empty()) {
            body["_config"] = config;
        }
        let filter = job_filter(options);
        if filter.as_object().is_some_and(|f| !f.is_empty()) {
            body["_filter"] = filter;
        }

        let response = self.call(&format!("sync/{}", kind.as_str()), body).await?;
        response
            .get("jobid")
            .and_then(Value::as_i64)
            .ok_or_else(|| RcError::Decode(format!("missing jobid in {}", response)))
    }

    async fn job_status(&self, job_id: i64) -> Result<JobStatus, RcError> {
        self.call_as("job/status", json!({ "jobid": job_id })).await
    }

    async fn job_stats(&self, job_id: i64) -> Result<TransferStats, RcError> {
        self.call_as("core/stats", json!({ "group": format!("job/{}", job_id) })).await
    }

    async fn stop_job(&self, job_id: i64) -> Result<(), RcError> {
        self.call("job/stop", json!({ "jobid": job_id })).await?;
        tracing::info!("Stopped rc job {}", job_id);
        Ok(())
    }
}
