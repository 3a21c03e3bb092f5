// 数据集组件上传引擎
//
// 上传流程：
// 1. 检查本地文件并规划分片
// 2. 文件不大于一个分片时单次上传
// 3. 否则创建分片传输 -> 并发上传所有分片 -> 完成传输
// 4. 任一分片失败时不调用完成接口，整体返回 PartsFailed

use crate::client::Connection;
use crate::config::{UploadConfig, UploadStrategy};
use crate::error::{Result, UploadError};
use crate::uploader::backend::{
    backend_for, CreateTransferRequest, SingleShotRequest, UploadBackend,
};
use crate::uploader::checksum::md5_file;
use crate::uploader::chunk::{
    human_bytes, ChunkLimits, ChunkPlanner, ChunkSpec, DEFAULT_CHUNK_SIZE,
};
use crate::uploader::element::DestinationKey;
use crate::uploader::scheduler::PartScheduler;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 上传选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// 上传方式
    pub strategy: UploadStrategy,
    /// 期望的分片大小（字节）
    pub chunk_size: u64,
    /// 是否允许分片上传
    pub use_multipart: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            strategy: UploadStrategy::Direct,
            chunk_size: DEFAULT_CHUNK_SIZE,
            use_multipart: true,
        }
    }
}

impl UploadOptions {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            strategy: config.strategy,
            chunk_size: config.chunk_size(),
            use_multipart: config.use_multipart,
        }
    }
}

/// 数据集组件上传器
pub struct DatasetUploader {
    backend: Arc<dyn UploadBackend>,
    options: UploadOptions,
    planner: ChunkPlanner,
    scheduler: PartScheduler,
}

impl DatasetUploader {
    /// 基于平台连接创建上传器
    pub fn new(
        connection: Arc<Connection>,
        options: UploadOptions,
        service_root: &str,
    ) -> Result<Self> {
        let max_simultaneous = connection.max_request_workers();
        let request_timeout = connection.request_timeout();
        let backend = backend_for(options.strategy, connection, service_root);
        Self::with_backend(backend, options, max_simultaneous, request_timeout)
    }

    /// 使用指定的上传协议创建上传器
    pub fn with_backend(
        backend: Arc<dyn UploadBackend>,
        options: UploadOptions,
        max_simultaneous: usize,
        request_timeout: Duration,
    ) -> Result<Self> {
        if backend.strategy() != options.strategy {
            return Err(UploadError::Configuration(format!(
                "上传方式不一致: 选项为 {:?}, 协议为 {:?}",
                options.strategy,
                backend.strategy()
            )));
        }

        let limits = ChunkLimits::for_strategy(options.strategy);
        limits.check(options.chunk_size)?;

        let scheduler = PartScheduler::new(backend.clone(), max_simultaneous, request_timeout);
        Ok(Self {
            backend,
            options,
            planner: ChunkPlanner::new(limits),
            scheduler,
        })
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// 上传文件到数据集组件
    ///
    /// # 参数
    /// * `path` - 本地文件路径
    /// * `key` - 上传目标
    /// * `md5` - 调用方已知的文件 MD5，未提供时读取整个文件计算
    pub async fn send(&self, path: &Path, key: &DestinationKey, md5: Option<String>) -> Result<()> {
        let file_size = file_size(path).await?;
        let started = Instant::now();
        info!(
            "开始上传: file={:?}, {}, 大小={}",
            path,
            key,
            human_bytes(file_size)
        );

        let limits = self.planner.limits();
        if !self.options.use_multipart && file_size < limits.max_chunk_size {
            self.send_single_shot(path, key, md5).await?;
        } else {
            let plan = self.planner.plan(file_size, self.options.chunk_size)?;
            if plan.is_multipart() {
                if plan.chunk_size != self.options.chunk_size {
                    warn!(
                        "分片大小已调整: {} -> {}",
                        human_bytes(self.options.chunk_size),
                        human_bytes(plan.chunk_size)
                    );
                }
                self.send_multipart(path, key, md5, file_size, plan.chunk_size, &plan.chunks)
                    .await?;
            } else {
                self.send_single_shot(path, key, md5).await?;
            }
        }

        info!(
            "上传完成: file={:?}, {}, 耗时={:.1}s",
            path,
            key,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    async fn send_single_shot(
        &self,
        path: &Path,
        key: &DestinationKey,
        md5: Option<String>,
    ) -> Result<()> {
        let checksum = match md5 {
            Some(md5) => md5,
            None => md5_file(path).await?,
        };
        let data = tokio::fs::read(path).await?;

        info!("单次上传: {}, 大小={}", key, human_bytes(data.len() as u64));
        let request = SingleShotRequest {
            key: key.clone(),
            filename: filename(path),
            checksum,
        };
        self.backend.upload_single_shot(&request, data).await
    }

    async fn send_multipart(
        &self,
        path: &Path,
        key: &DestinationKey,
        md5: Option<String>,
        file_size: u64,
        chunk_size: u64,
        chunks: &[ChunkSpec],
    ) -> Result<()> {
        let checksum = match md5 {
            Some(md5) => md5,
            None => md5_file(path).await?,
        };
        let request = CreateTransferRequest {
            key: key.clone(),
            filename: filename(path),
            chunk_size,
            total_size: file_size,
            checksum,
        };
        let ack = self.backend.create_transfer(&request).await?;
        if let Some(total_parts) = ack.total_parts {
            if total_parts != chunks.len() as u64 {
                warn!(
                    "服务端分片数与本地规划不一致: 服务端={}, 本地={}",
                    total_parts,
                    chunks.len()
                );
            }
        }

        let report = self.scheduler.run(path, key, chunks).await;
        if !report.is_success() {
            let failures = report.failures();
            error!(
                "分片上传失败，不完成传输: file={:?}, {}, 失败分片={:?}",
                path,
                key,
                failures.iter().map(|f| f.index).collect::<Vec<_>>()
            );
            return Err(UploadError::PartsFailed {
                file: path.to_path_buf(),
                destination: key.to_string(),
                failures,
            });
        }

        self.backend.complete_transfer(key).await
    }
}

async fn file_size(path: &Path) -> Result<u64> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(UploadError::FileNotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_file() {
        return Err(UploadError::Validation(format!("不是文件: {:?}", path)));
    }
    if metadata.len() == 0 {
        return Err(UploadError::Validation(format!("文件为空: {:?}", path)));
    }
    Ok(metadata.len())
}

fn filename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
