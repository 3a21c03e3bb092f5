// 配置管理模块

use crate::auth::CredentialsConfig;
use crate::uploader::chunk::{ChunkLimits, MIN_CHUNK_SIZE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 连接配置
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// 平台地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 单个请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 并发请求数上限（分片上传的最大并发）
    #[serde(default = "default_max_request_workers")]
    pub max_request_workers: usize,
    /// 附加的 User-Agent
    #[serde(default)]
    pub user_agent: Option<String>,
    /// 客户端凭证
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
}

fn default_base_url() -> String {
    "https://app.alteia.com".to_string()
}

/// 单个请求超时上限: 1 天
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 24 * 60 * 60;

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_max_request_workers() -> usize {
    6
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            max_request_workers: default_max_request_workers(),
            user_agent: None,
            credentials: None,
        }
    }
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 上传方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStrategy {
    /// 通过签名 URL 直传对象存储
    #[default]
    Direct,
    /// 经数据管理服务中转
    Legacy,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 上传方式
    #[serde(default)]
    pub strategy: UploadStrategy,
    /// 分片大小 (MB)，direct 方式 5MB-5GB，legacy 方式 5MB-100MB
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 是否允许分片上传
    #[serde(default = "default_use_multipart")]
    pub use_multipart: bool,
    /// 数据管理服务路径前缀
    #[serde(default = "default_service_root")]
    pub service_root: String,
}

fn default_chunk_size_mb() -> u64 {
    MIN_CHUNK_SIZE / 1024 / 1024
}

fn default_use_multipart() -> bool {
    true
}

fn default_service_root() -> String {
    "data-manager".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            strategy: UploadStrategy::default(),
            chunk_size_mb: default_chunk_size_mb(),
            use_multipart: default_use_multipart(),
            service_root: default_service_root(),
        }
    }
}

impl UploadConfig {
    /// 分片大小（字节），溢出时取 u64::MAX，由校验拒绝
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mb.saturating_mul(1024 * 1024)
    }
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
}

fn default_log_enabled() -> bool {
    false
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

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// 从 TOML 文本解析并校验
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content).context("解析配置文件失败")?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.connection.max_request_workers == 0 {
            anyhow::bail!("max_request_workers 必须大于 0");
        }
        if self.connection.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs 必须大于 0");
        }
        if self.connection.request_timeout_secs > MAX_REQUEST_TIMEOUT_SECS {
            anyhow::bail!(
                "request_timeout_secs 不能超过 {}: {}",
                MAX_REQUEST_TIMEOUT_SECS,
                self.connection.request_timeout_secs
            );
        }
        ChunkLimits::for_strategy(self.upload.strategy)
            .check(self.upload.chunk_size())
            .context("上传分片大小配置错误")?;
        Ok(())
    }
}
