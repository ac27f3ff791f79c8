use sqlx::SqlitePool;
use std::sync::Arc;

use rclone_panel_backend::config::AppConfig;
use rclone_panel_backend::rclone::{RcClient, RcServer};
use rclone_panel_backend::task::TaskManager;

pub struct AppState {
    pub db: SqlitePool,
    pub task_manager: TaskManager,
    pub rc: Arc<RcClient>,
    /// Locally launched `rclone rcd` / 本地启动的 rc 服务
    pub rc_server: Arc<RcServer>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn rclone_binary(&self) -> &str {
        &self.config.rclone.binary
    }
}
