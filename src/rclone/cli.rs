//! One-shot rclone commands / rclone 命令行辅助
//!
//! Version detection, `rclone config show` parsing and the config file itself.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::process::Command;

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"rclone v([0-9.]+)").unwrap());
static KEY_VALUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([\w-]+)\s*=\s*(.*)$").unwrap());

/// rclone 安装状态
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RcloneStatus {
    pub installed: bool,
    pub version: Option<String>,
    pub path: Option<String>,
    pub full_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A remote as reported by `rclone config show` / 配置中的远程存储
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConfiguredRemote {
    pub name: String,
    #[serde(rename = "type")]
    pub remote_type: String,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigFile {
    pub path: String,
    pub content: String,
    pub exists: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run rclone and capture stdout / 执行 rclone 并读取输出
async fn run(binary: &str, args: &[&str]) -> Result<String, String> {
    let output = Command::new(binary)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", binary, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(if stderr.is_empty() {
            format!("{} {} exited with {}", binary, args.join(" "), output.status)
        } else {
            stderr
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// 解析版本号
pub fn parse_version(output: &str) -> Option<String> {
    VERSION_RE.captures(output).map(|c| c[1].to_string())
}

/// Locate the executable the way a shell would / 在 PATH 中查找可执行文件
pub fn find_binary(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|path| path.is_file())
}

/// Detect rclone / 检测 rclone 安装情况
pub async fn status(binary: &str) -> RcloneStatus {
    let path = find_binary(binary).map(|p| p.to_string_lossy().into_owned());
    match run(binary, &["version"]).await {
        Ok(stdout) => RcloneStatus {
            installed: true,
            version: parse_version(&stdout),
            path,
            full_version: Some(stdout.trim().to_string()),
            error: None,
        },
        Err(e) => RcloneStatus {
            installed: false,
            version: None,
            path,
            full_version: None,
            error: Some(e),
        },
    }
}

/// Parse `rclone config show` output / 解析 rclone config show
///
/// Sections start with `[name]` (current rclone) or `# name` (older builds).
pub fn parse_config_show(output: &str) -> Vec<ConfiguredRemote> {
    let mut remotes = Vec::new();
    let mut current: Option<ConfiguredRemote> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let header = line
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .or_else(|| line.strip_prefix("# "));
        if let Some(name) = header {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if let Some(remote) = current.take() {
                remotes.push(remote);
            }
            current = Some(ConfiguredRemote {
                name: name.to_string(),
                remote_type: "unknown".to_string(),
                config: BTreeMap::new(),
            });
            continue;
        }

        let (Some(remote), Some(caps)) = (current.as_mut(), KEY_VALUE_RE.captures(line)) else {
            continue;
        };
        let key = &caps[1];
        let value = caps[2].trim().to_string();
        if key == "type" {
            remote.remote_type = value;
        } else {
            remote.config.insert(key.to_string(), value);
        }
    }

    if let Some(remote) = current {
        remotes.push(remote);
    }
    remotes
}

/// 获取已配置的远程存储
pub async fn list_remotes(binary: &str) -> Result<Vec<ConfiguredRemote>, String> {
    let stdout = run(binary, &["config", "show"]).await?;
    Ok(parse_config_show(&stdout))
}

fn default_config_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".config").join("rclone").join("rclone.conf")
}

/// Config file location reported by rclone / 获取配置文件路径
pub async fn config_path(binary: &str) -> PathBuf {
    match run(binary, &["config", "file"]).await {
        // 输出形如 "Configuration file is stored at:\n/path/rclone.conf"
        Ok(stdout) => stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .filter(|line| !line.ends_with(':'))
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path),
        Err(e) => {
            tracing::debug!("rclone config file failed, using default path: {}", e);
            default_config_path()
        }
    }
}

/// 读取配置文件
pub async fn read_config(path: &Path) -> std::io::Result<ConfigFile> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => Some(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };
    Ok(ConfigFile {
        path: path.to_string_lossy().into_owned(),
        exists: content.is_some(),
        content: content.unwrap_or_default(),
    })
}

/// Replace the config file atomically / 原子写入配置文件
pub async fn write_config(path: &Path, content: String) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Check the written config parses / 校验配置
pub async fn validate_config(binary: &str) -> ConfigValidation {
    match run(binary, &["config", "show"]).await {
        Ok(output) => ConfigValidation { valid: true, output: Some(output), error: None },
        Err(e) => ConfigValidation { valid: false, output: None, error: Some(e) },
    }
}
