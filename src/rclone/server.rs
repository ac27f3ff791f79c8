//! Managed `rclone rcd` instance / 受管理的 rclone rc 服务
//!
//! The panel can either talk to an rc server started elsewhere or launch its
//! own. Only a server launched here can be stopped from here.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::rc::RcClient;
use crate::config::RcloneConfig;

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL: Duration = Duration::from_millis(250);

/// rc 服务状态
#[derive(Debug, Clone, serde::Serialize)]
pub struct RcServerStatus {
    pub running: bool,
    /// Launched by this panel (and therefore stoppable)
    pub managed: bool,
    pub pid: Option<u32>,
    pub url: String,
}

pub struct RcServer {
    config: RcloneConfig,
    client: Arc<RcClient>,
    child: Mutex<Option<Child>>,
}

/// Arguments for `rclone rcd` / 构建 rcd 参数
pub fn rcd_args(config: &RcloneConfig) -> Vec<String> {
    let mut args = vec!["rcd".to_string(), "--rc-addr".to_string(), config.rc_addr()];
    match (&config.rc_user, &config.rc_pass) {
        (Some(user), Some(pass)) if !user.is_empty() => {
            args.push("--rc-user".to_string());
            args.push(user.clone());
            args.push("--rc-pass".to_string());
            args.push(pass.clone());
        }
        _ => args.push("--rc-no-auth".to_string()),
    }
    args
}

impl RcServer {
    pub fn new(config: RcloneConfig, client: Arc<RcClient>) -> Self {
        Self {
            config,
            client,
            child: Mutex::new(None),
        }
    }

    /// 查询状态
    pub async fn status(&self) -> RcServerStatus {
        let mut child = self.child.lock().await;
        // 子进程已退出则清理
        if let Some(c) = child.as_mut() {
            if let Ok(Some(status)) = c.try_wait() {
                tracing::warn!("rclone rcd exited on its own: {}", status);
                *child = None;
            }
        }
        RcServerStatus {
            running: self.client.is_running().await,
            managed: child.is_some(),
            pid: child.as_ref().and_then(|c| c.id()),
            url: self.client.base_url().to_string(),
        }
    }

    /// Launch `rclone rcd` and wait until it answers / 启动 rc 服务
    pub async fn start(&self) -> Result<RcServerStatus, String> {
        if self.client.is_running().await {
            return Err(format!("rclone rc server already running at {}", self.client.base_url()));
        }

        {
            let mut guard = self.child.lock().await;
            let child = Command::new(&self.config.binary)
                .args(rcd_args(&self.config))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| format!("failed to launch {}: {}", self.config.binary, e))?;
            tracing::info!("Started rclone rcd (pid {:?}) on {}", child.id(), self.config.rc_addr());
            *guard = Some(child);
        }

        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.client.is_running().await {
                return Ok(self.status().await);
            }
            if let Some(code) = self.exited_early().await {
                return Err(format!("rclone rcd exited during startup ({})", code));
            }
            tokio::time::sleep(READY_POLL).await;
        }

        self.stop().await.ok();
        Err(format!("rclone rc server did not answer within {}s", READY_TIMEOUT.as_secs()))
    }

    async fn exited_early(&self) -> Option<String> {
        let mut guard = self.child.lock().await;
        let status = guard.as_mut()?.try_wait().ok()??;
        *guard = None;
        Some(status.to_string())
    }

    /// 停止 rc 服务（仅限本面板启动的实例）
    pub async fn stop(&self) -> Result<(), String> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Err("rclone rc server was not started by this panel".to_string());
        };
        if let Err(e) = child.start_kill() {
            tracing::debug!("rclone rcd already gone: {}", e);
        }
        match child.wait().await {
            Ok(status) => tracing::info!("rclone rcd stopped: {}", status),
            Err(e) => tracing::warn!("Failed to reap rclone rcd: {}", e),
        }
        Ok(())
    }

    pub async fn restart(&self) -> Result<RcServerStatus, String> {
        if let Err(e) = self.stop().await {
            tracing::debug!("Restart without managed server: {}", e);
        }
        self.start().await
    }
}
