// 上传分片规划
//
// 对象存储分片上传规则：
// - 除最后一个分片外，每个分片 >= 5MB
// - 单个分片 <= 5GB；经由数据管理服务中转（legacy）时 <= 100MB
// - 单次传输最多 10000 个分片
// - 文件不大于一个分片时不走分片上传，直接单次上传

use crate::config::UploadStrategy;
use crate::error::{Result, UploadError};
use tracing::{debug, info, warn};

/// 最小分片大小: 5MB（最后一个分片除外）
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 对象存储允许的最大分片大小: 5GB
pub const MAX_CHUNK_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// 经数据管理服务中转时的最大分片大小: 100MB
pub const SERVICE_MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// 单次传输最大分片数
pub const MAX_PARTS: u64 = 10_000;

/// 默认分片大小: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 将字节数格式化为人类可读的字符串（日志、错误信息用）
pub fn human_bytes(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", size, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// 分片大小约束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    /// 最小分片大小（最后一个分片可以更小）
    pub min_chunk_size: u64,
    /// 最大分片大小（已取对象存储与中转服务上限中的较小者）
    pub max_chunk_size: u64,
    /// 最大分片数
    pub max_parts: u64,
}

impl ChunkLimits {
    /// 创建自定义约束
    ///
    /// 上下限颠倒、为 0 时返回配置错误
    pub fn new(min_chunk_size: u64, max_chunk_size: u64, max_parts: u64) -> Result<Self> {
        if min_chunk_size == 0 {
            return Err(UploadError::Configuration(
                "最小分片大小必须大于 0".to_string(),
            ));
        }
        if max_chunk_size < min_chunk_size {
            return Err(UploadError::Configuration(format!(
                "最大分片大小 {} 小于最小分片大小 {}",
                human_bytes(max_chunk_size),
                human_bytes(min_chunk_size)
            )));
        }
        if max_parts == 0 {
            return Err(UploadError::Configuration(
                "最大分片数必须大于 0".to_string(),
            ));
        }
        Ok(Self {
            min_chunk_size,
            max_chunk_size,
            max_parts,
        })
    }

    /// 根据上传方式获取约束
    pub fn for_strategy(strategy: UploadStrategy) -> Self {
        let max_chunk_size = match strategy {
            UploadStrategy::Direct => MAX_CHUNK_SIZE,
            UploadStrategy::Legacy => MAX_CHUNK_SIZE.min(SERVICE_MAX_CHUNK_SIZE),
        };
        Self {
            min_chunk_size: MIN_CHUNK_SIZE,
            max_chunk_size,
            max_parts: MAX_PARTS,
        }
    }

    /// 检查调用方指定的分片大小是否落在允许范围内
    pub fn check(&self, chunk_size: u64) -> Result<()> {
        if chunk_size < self.min_chunk_size {
            return Err(UploadError::Configuration(format!(
                "分片大小必须 >= {}; 实际: {}",
                human_bytes(self.min_chunk_size),
                human_bytes(chunk_size)
            )));
        }
        if chunk_size > self.max_chunk_size {
            return Err(UploadError::Configuration(format!(
                "分片大小必须 <= {}; 实际: {}",
                human_bytes(self.max_chunk_size),
                human_bytes(chunk_size)
            )));
        }
        Ok(())
    }

    fn clamp(&self, chunk_size: u64) -> u64 {
        chunk_size.clamp(self.min_chunk_size, self.max_chunk_size)
    }
}

/// 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// 单次上传整个文件
    SingleShot,
    /// 分片上传
    Multipart,
}

/// 分片描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// 分片索引（从 0 开始，用于计算文件偏移）
    pub index: usize,
    /// 起始偏移
    pub offset: u64,
    /// 分片长度
    pub len: u64,
}

impl ChunkSpec {
    /// 远端分片号（从 1 开始）
    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }
}

/// 规划结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    /// 文件大小
    pub file_size: u64,
    /// 协商后的分片大小
    pub chunk_size: u64,
    /// 传输方式
    pub mode: TransferMode,
    /// 分片列表；单次上传时只有一个覆盖整个文件的分片
    pub chunks: Vec<ChunkSpec>,
}

impl UploadPlan {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_multipart(&self) -> bool {
        self.mode == TransferMode::Multipart
    }
}

/// 分片规划器
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    limits: ChunkLimits,
}

impl ChunkPlanner {
    pub fn new(limits: ChunkLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ChunkLimits {
        &self.limits
    }

    /// 规划分片
    ///
    /// # 参数
    /// * `file_size` - 文件大小
    /// * `requested_chunk_size` - 期望的分片大小（会被限制在允许范围内）
    ///
    /// # 返回
    /// 分片大小、传输方式与分片列表。分片数超过上限时会放大分片，永远不会反过来
    pub fn plan(&self, file_size: u64, requested_chunk_size: u64) -> Result<UploadPlan> {
        if file_size == 0 {
            return Err(UploadError::Validation("文件大小必须大于 0".to_string()));
        }
        if requested_chunk_size == 0 {
            return Err(UploadError::Validation("分片大小必须大于 0".to_string()));
        }

        let mut chunk_size = self.limits.clamp(requested_chunk_size);
        let mut chunk_count = file_size.div_ceil(chunk_size);

        if chunk_count > self.limits.max_parts {
            warn!(
                "分片过多: 分片大小={}, 文件大小={}, 分片数={}",
                human_bytes(chunk_size),
                human_bytes(file_size),
                chunk_count
            );
            chunk_size = self
                .limits
                .clamp(file_size.div_ceil(self.limits.max_parts));
            chunk_count = file_size.div_ceil(chunk_size);

            if chunk_count > self.limits.max_parts {
                return Err(UploadError::Validation(format!(
                    "文件过大: {} 超过 {} 个 {} 分片的上限",
                    human_bytes(file_size),
                    self.limits.max_parts,
                    human_bytes(self.limits.max_chunk_size)
                )));
            }
            info!(
                "调整分片大小: {}, 分片数={}",
                human_bytes(chunk_size),
                chunk_count
            );
        }

        // 文件不大于一个分片：强制单次上传
        if file_size <= chunk_size {
            debug!(
                "文件 {} 不大于分片 {}，使用单次上传",
                human_bytes(file_size),
                human_bytes(chunk_size)
            );
            return Ok(UploadPlan {
                file_size,
                chunk_size,
                mode: TransferMode::SingleShot,
                chunks: vec![ChunkSpec {
                    index: 0,
                    offset: 0,
                    len: file_size,
                }],
            });
        }

        let chunks = Self::calculate_chunks(file_size, chunk_size);
        debug_assert_eq!(chunks.len() as u64, chunk_count);

        info!(
            "分片规划完成: 文件大小={}, 分片大小={}, 分片数={}",
            human_bytes(file_size),
            human_bytes(chunk_size),
            chunks.len()
        );

        Ok(UploadPlan {
            file_size,
            chunk_size,
            mode: TransferMode::Multipart,
            chunks,
        })
    }

    fn calculate_chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkSpec> {
        let mut chunks = Vec::new();
        let mut offset = 0u64;
        let mut index = 0;

        while offset < file_size {
            let end = std::cmp::min(offset + chunk_size, file_size);
            chunks.push(ChunkSpec {
                index,
                offset,
                len: end - offset,
            });
            offset = end;
            index += 1;
        }

        chunks
    }
}
