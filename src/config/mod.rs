// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 并发上传文件数下限
pub const MIN_CONCURRENT_TASKS: usize = 1;
/// 并发上传文件数上限
pub const MAX_CONCURRENT_TASKS: usize = 10;

/// 将并发数限制在 [1, 10]
pub fn clamp_concurrency(n: usize) -> usize {
    n.clamp(MIN_CONCURRENT_TASKS, MAX_CONCURRENT_TASKS)
}

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 远端服务配置
    #[serde(default)]
    pub remote: RemoteConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传文件数（1-10）
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 服务端未下发分片大小时使用的默认值（字节）
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    /// 会话创建请求的全局最小间隔（毫秒）
    #[serde(default = "default_session_rate_limit_ms")]
    pub session_rate_limit_ms: u64,
    /// 每个任务开始前的延迟（毫秒）
    #[serde(default = "default_pipeline_start_delay_ms")]
    pub pipeline_start_delay_ms: u64,
    /// 速度采样间隔（毫秒）
    #[serde(default = "default_speed_sample_interval_ms")]
    pub speed_sample_interval_ms: u64,
    /// 拖入时忽略的系统文件名
    #[serde(default = "default_ignored_file_names")]
    pub ignored_file_names: Vec<String>,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_chunk_size() -> u64 {
    crate::uploader::DEFAULT_UPLOAD_CHUNK_SIZE
}

fn default_session_rate_limit_ms() -> u64 {
    20
}

fn default_pipeline_start_delay_ms() -> u64 {
    50
}

fn default_speed_sample_interval_ms() -> u64 {
    1000
}

fn default_ignored_file_names() -> Vec<String> {
    [".DS_Store", "Thumbs.db", "desktop.ini"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_chunk_size: default_chunk_size(),
            session_rate_limit_ms: default_session_rate_limit_ms(),
            pipeline_start_delay_ms: default_pipeline_start_delay_ms(),
            speed_sample_interval_ms: default_speed_sample_interval_ms(),
            ignored_file_names: default_ignored_file_names(),
        }
    }
}

impl UploadConfig {
    pub fn session_rate_limit(&self) -> Duration {
        Duration::from_millis(self.session_rate_limit_ms)
    }

    pub fn pipeline_start_delay(&self) -> Duration {
        Duration::from_millis(self.pipeline_start_delay_ms)
    }

    pub fn speed_sample_interval(&self) -> Duration {
        Duration::from_millis(self.speed_sample_interval_ms.max(1))
    }

    /// 是否为忽略列表中的文件名
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored_file_names.iter().any(|n| n == name)
    }
}

/// 远端服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// API 根地址，例如 `http://127.0.0.1:5212/api/v4`
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer Token
    #[serde(default)]
    pub token: Option<String>,
    /// 普通请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 分片/整文件传输超时（秒）
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:5212/api/v4".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_transfer_timeout_secs() -> u64 {
    600
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let mut config: AppConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        if config.remote.base_url.trim().is_empty() {
            anyhow::bail!("配置文件中的 remote.base_url 不能为空");
        }
        config.upload.max_concurrent_tasks = clamp_concurrency(config.upload.max_concurrent_tasks);

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
