//! Application configuration module / 应用配置模块
//!
//! Manages application configuration loaded from config.json
//! Creates default config file on first run / 首次运行时创建默认配置文件

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration / 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration / 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration / 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,
    /// rclone binary and RC server / rclone 配置
    #[serde(default)]
    pub rclone: RcloneConfig,
    /// Task pipeline tuning / 任务配置
    #[serde(default)]
    pub tasks: TaskConfig,
}

/// Server configuration / 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address / 服务器监听地址
    pub host: String,
    /// Server port / 服务器端口
    pub port: u16,
}

/// Database configuration / 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Data directory path / 数据目录路径
    pub data_dir: String,
    /// Main database file path (relative to data_dir) / 主数据库文件路径
    pub db_file: String,
}

/// rclone configuration / rclone 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RcloneConfig {
    /// rclone executable (name on PATH or absolute path) / rclone 可执行文件
    pub binary: String,
    /// Value for `--stats` / 进度输出间隔
    pub stats_interval: String,
    /// RC server host / RC 服务地址
    pub rc_host: String,
    /// RC server port / RC 服务端口
    pub rc_port: u16,
    /// RC basic auth user (no auth when empty) / RC 用户名
    pub rc_user: Option<String>,
    /// RC basic auth password / RC 密码
    pub rc_pass: Option<String>,
    /// RC request timeout in seconds / RC 请求超时（秒）
    pub request_timeout_secs: u64,
}

/// Task pipeline configuration / 任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// RC job poll interval / RC 作业轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// Consecutive poll failures before a job is given up / 连续轮询失败上限
    pub max_poll_failures: u32,
    /// Minimum seconds between progress writes per task / 进度持久化最小间隔（秒）
    pub persist_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8190,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            db_file: "rclone-panel.db".to_string(),
        }
    }
}

impl Default for RcloneConfig {
    fn default() -> Self {
        Self {
            binary: "rclone".to_string(),
            stats_interval: "5s".to_string(),
            rc_host: "127.0.0.1".to_string(),
            rc_port: 5572,
            rc_user: None,
            rc_pass: None,
            request_timeout_secs: 30,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_poll_failures: 5,
            persist_interval_secs: 5,
        }
    }
}

impl RcloneConfig {
    /// RC server base URL / RC 服务地址
    pub fn rc_url(&self) -> String {
        format!("http://{}:{}", self.rc_host, self.rc_port)
    }

    /// `host:port` passed to `rclone rcd --rc-addr`
    pub fn rc_addr(&self) -> String {
        format!("{}:{}", self.rc_host, self.rc_port)
    }
}

impl AppConfig {
    /// Get the full database URL / 获取完整的数据库URL
    pub fn get_database_url(&self) -> String {
        let db_path = Path::new(&self.database.data_dir).join(&self.database.db_file);
        format!("sqlite:{}?mode=rwc", db_path.to_string_lossy())
    }

    /// Get the full data directory path / 获取完整的数据目录路径
    pub fn get_data_dir(&self) -> PathBuf {
        PathBuf::from(&self.database.data_dir)
    }

    /// Get the server bind address / 获取服务器绑定地址
    pub fn get_bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// RC server base URL / RC 服务地址
    pub fn rc_url(&self) -> String {
        self.rclone.rc_url()
    }
}

/// Get the config file path / 获取配置文件路径
fn get_config_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config.json")
}

/// Load configuration from file, or create default if not exists / 加载配置文件，不存在则创建默认配置
pub fn load_config() -> Result<AppConfig, String> {
    load_config_from(&get_config_path())
}

fn load_config_from(config_path: &Path) -> Result<AppConfig, String> {
    if config_path.exists() {
        // Load existing config / 加载现有配置
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;

        tracing::info!("Loaded configuration from {:?}", config_path);
        Ok(config)
    } else {
        // Create default config / 创建默认配置
        let config = AppConfig::default();
        save_config_to(&config, config_path)?;
        tracing::info!("Created default configuration at {:?}", config_path);
        Ok(config)
    }
}

/// Save configuration to file / 保存配置到文件
fn save_config_to(config: &AppConfig, config_path: &Path) -> Result<(), String> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    std::fs::write(config_path, content)
        .map_err(|e| format!("Failed to write config file: {}", e))?;

    Ok(())
}
