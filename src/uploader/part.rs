// 分片上传状态
//
// 状态流转：Pending -> InFlight -> (Available | Failed)
// 首次尝试收到 401 时 InFlight -> Pending，给令牌续期一次机会

use crate::error::PartFailure;
use crate::uploader::backend::PartUploadTarget;
use crate::uploader::chunk::ChunkSpec;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartStatus {
    /// 等待上传
    Pending,
    /// 请求已发出，尚未观察到结果
    InFlight,
    /// 上传成功
    Available,
    /// 上传失败（终态）
    Failed,
}

impl PartStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PartStatus::Available | PartStatus::Failed)
    }
}

/// 单次分片请求的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartOutcome {
    /// 收到 HTTP 响应
    Response { status: u16, body: String },
    /// 请求未能完成（连接失败、超时、读文件失败等）
    Error(String),
}

/// 单个分片的上传状态
#[derive(Debug, Clone)]
pub struct UploadPart {
    /// 分片索引
    pub index: usize,
    /// 远端分片号（index + 1）
    pub part_number: u32,
    /// 起始偏移
    pub offset: u64,
    /// 分片长度
    pub size: u64,
    /// 当前状态
    pub status: PartStatus,
    /// 已尝试次数
    pub attempt: u32,
    /// 分片 MD5（首次读取时计算）
    pub md5: Option<String>,
    /// 上传地址（direct 方式下缓存签名 URL，重试时复用）
    pub target: Option<PartUploadTarget>,
    /// 最后一次错误
    pub error: Option<String>,
}

impl UploadPart {
    pub fn new(spec: ChunkSpec) -> Self {
        Self {
            index: spec.index,
            part_number: spec.part_number(),
            offset: spec.offset,
            size: spec.len,
            status: PartStatus::Pending,
            attempt: 0,
            md5: None,
            target: None,
            error: None,
        }
    }

    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }

    /// 是否可以调度（等待中且没有未完成的请求）
    pub fn is_waiting(&self) -> bool {
        self.status == PartStatus::Pending
    }

    /// 开始一次新的尝试
    pub fn begin_attempt(&mut self) {
        debug_assert!(self.is_waiting(), "分片#{} 已有未完成请求", self.index);
        self.attempt += 1;
        self.status = PartStatus::InFlight;
    }

    /// 根据请求结果更新状态
    ///
    /// 返回更新后的状态
    pub fn apply(&mut self, outcome: PartOutcome) -> PartStatus {
        self.status = match outcome {
            PartOutcome::Response { status, .. } if (200..300).contains(&status) => {
                self.error = None;
                PartStatus::Available
            }
            PartOutcome::Response { status: 401, body } if self.attempt == 1 => {
                self.error = Some(format!("HTTP 401: {}", body));
                PartStatus::Pending
            }
            PartOutcome::Response { status, body } => {
                self.error = Some(format!("HTTP {}: {}", status, body));
                PartStatus::Failed
            }
            PartOutcome::Error(reason) => {
                self.error = Some(reason);
                PartStatus::Failed
            }
        };
        self.status
    }

    /// 不经请求直接判定失败（例如获取上传地址失败）
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.status = PartStatus::Failed;
    }

    /// 转换为失败记录
    pub fn failure(&self) -> PartFailure {
        PartFailure {
            index: self.index,
            part_number: self.part_number,
            attempts: self.attempt,
            reason: self
                .error
                .clone()
                .unwrap_or_else(|| format!("{:?}", self.status)),
        }
    }
}
