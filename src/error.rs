//! 上传错误类型
//!
//! 分片级别的失败不会直接抛给调用方，而是汇总进 `PartsFailed`

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// 单个分片的失败记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartFailure {
    /// 分片索引（从 0 开始）
    pub index: usize,
    /// 远端分片号（从 1 开始）
    pub part_number: u32,
    /// 已尝试次数
    pub attempts: u32,
    /// 最后一次失败原因（状态码或响应内容）
    pub reason: String,
}

impl fmt::Display for PartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "分片#{} (part {}, 尝试 {} 次): {}",
            self.index, self.part_number, self.attempts, self.reason
        )
    }
}

fn join_failures(failures: &[PartFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// 上传错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 参数非法（文件大小、分片大小等）
    #[error("参数错误: {0}")]
    Validation(String),

    /// 分片大小上下限配置错误
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 本地文件不存在
    #[error("文件不存在: {0:?}")]
    FileNotFound(PathBuf),

    /// 一个或多个分片最终失败，传输未完成
    #[error("上传失败: file={file:?}, destination={destination}, 失败分片: [{}]", join_failures(.failures))]
    PartsFailed {
        file: PathBuf,
        destination: String,
        failures: Vec<PartFailure>,
    },

    /// 服务端返回非 2xx 状态
    #[error("HTTP {status} {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },

    /// 请求发送失败（连接、超时等）
    #[error("请求失败: {0}")]
    Request(#[from] reqwest::Error),

    /// 响应解析失败
    #[error("响应解析失败: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 访问令牌续期失败
    #[error("令牌续期失败: {0}")]
    TokenRenewal(String),
}

impl UploadError {
    /// 失败分片的索引列表（仅 `PartsFailed` 有值）
    pub fn failed_indices(&self) -> Vec<usize> {
        match self {
            UploadError::PartsFailed { failures, .. } => {
                failures.iter().map(|f| f.index).collect()
            }
            _ => Vec::new(),
        }
    }

    /// HTTP 状态码（仅 `Http` 有值）
    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;
