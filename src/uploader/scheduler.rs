// 分片上传调度器
//
// 功能：
// - 协调任务独占所有分片状态，上传任务只通过 channel 回报结果
// - 并发控制：未观察到结果的请求数不超过 max_simultaneous
// - 首次尝试收到 401 的分片回到等待状态，重新调度一次
// - 等待结果有超时，超时后仍未返回的分片判定失败

use crate::client::RawResponse;
use crate::error::PartFailure;
use crate::uploader::backend::{PartRequest, PartUploadTarget, UploadBackend};
use crate::uploader::checksum::md5_bytes;
use crate::uploader::chunk::ChunkSpec;
use crate::uploader::element::DestinationKey;
use crate::uploader::part::{PartOutcome, PartStatus, UploadPart};
use futures::FutureExt;
use std::io::{Read, Seek, SeekFrom};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// 收尾阶段等待的上限
const MAX_DRAIN_WAIT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// 上传任务回报的结果
#[derive(Debug)]
struct PartEvent {
    index: usize,
    /// 对应的尝试次数，用于丢弃过期结果
    attempt: u32,
    md5: Option<String>,
    target: Option<PartUploadTarget>,
    outcome: PartOutcome,
}

impl PartEvent {
    fn error(index: usize, attempt: u32, reason: impl Into<String>) -> Self {
        Self {
            index,
            attempt,
            md5: None,
            target: None,
            outcome: PartOutcome::Error(reason.into()),
        }
    }
}

/// 单次分片上传所需的全部信息
struct PartJob {
    index: usize,
    attempt: u32,
    path: PathBuf,
    offset: u64,
    size: u64,
    request: PartRequest,
    md5: Option<String>,
    target: Option<PartUploadTarget>,
}

/// 调度结果
#[derive(Debug)]
pub struct ScheduleReport {
    /// 所有分片的最终状态
    pub parts: Vec<UploadPart>,
    /// 发出的分片请求总数（含重试）
    pub requests: u32,
    /// 观察到的最大并发请求数
    pub max_outstanding: usize,
}

impl ScheduleReport {
    pub fn is_success(&self) -> bool {
        self.parts.iter().all(|p| p.status == PartStatus::Available)
    }

    pub fn failures(&self) -> Vec<PartFailure> {
        self.parts
            .iter()
            .filter(|p| p.status != PartStatus::Available)
            .map(UploadPart::failure)
            .collect()
    }
}

/// 分片上传调度器
pub struct PartScheduler {
    backend: Arc<dyn UploadBackend>,
    max_simultaneous: usize,
    request_timeout: Duration,
}

impl PartScheduler {
    pub fn new(
        backend: Arc<dyn UploadBackend>,
        max_simultaneous: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            max_simultaneous: max_simultaneous.max(1),
            request_timeout,
        }
    }

    pub fn max_simultaneous(&self) -> usize {
        self.max_simultaneous
    }

    /// 上传所有分片，直到每个分片都成功或失败
    pub async fn run(
        &self,
        path: &Path,
        key: &DestinationKey,
        chunks: &[ChunkSpec],
    ) -> ScheduleReport {
        let mut parts: Vec<UploadPart> = chunks.iter().cloned().map(UploadPart::new).collect();
        let (tx, mut rx) = mpsc::unbounded_channel::<PartEvent>();
        let mut requests = 0u32;
        let mut max_outstanding = 0usize;

        info!(
            "开始上传分片: {}, 分片数={}, 最大并发={}",
            key,
            parts.len(),
            self.max_simultaneous
        );

        while parts.iter().any(|p| !p.status.is_terminal()) {
            let outstanding = count_in_flight(&parts);
            let next = parts.iter().position(UploadPart::is_waiting);

            match next {
                Some(index) if outstanding < self.max_simultaneous => {
                    self.submit(&mut parts[index], path, key, tx.clone());
                    requests += 1;
                    max_outstanding = max_outstanding.max(outstanding + 1);
                }
                Some(_) => {
                    // 并发已满，等待任意一个请求完成
                    match tokio::time::timeout(self.request_timeout, rx.recv()).await {
                        Ok(Some(event)) => observe(&mut parts, event),
                        _ => {
                            warn!("等待分片完成超时: {}, 未完成请求数={}", key, outstanding);
                            self.drain(&mut parts, &mut rx, key).await;
                        }
                    }
                }
                None => {
                    // 没有可提交的分片，等待剩余请求全部完成
                    self.drain(&mut parts, &mut rx, key).await;
                }
            }
        }

        let report = ScheduleReport {
            parts,
            requests,
            max_outstanding,
        };
        if report.is_success() {
            info!("分片全部上传成功: {}, 请求数={}", key, report.requests);
        } else {
            error!(
                "分片上传失败: {}, 失败分片数={}",
                key,
                report.failures().len()
            );
        }
        report
    }

    /// 等待所有未完成请求，总等待时间为 未完成数 × 请求超时
    ///
    /// 超时后仍未返回的分片判定失败，其迟到的结果会被丢弃
    async fn drain(
        &self,
        parts: &mut [UploadPart],
        rx: &mut mpsc::UnboundedReceiver<PartEvent>,
        key: &DestinationKey,
    ) {
        let outstanding = count_in_flight(parts);
        if outstanding == 0 {
            return;
        }

        let wait = self
            .request_timeout
            .saturating_mul(u32::try_from(outstanding).unwrap_or(u32::MAX))
            .min(MAX_DRAIN_WAIT);
        let deadline = Instant::now() + wait;
        while count_in_flight(parts) > 0 {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => observe(parts, event),
                _ => break,
            }
        }

        let stuck = count_in_flight(parts);
        if stuck > 0 {
            warn!("等待未完成请求超时: {}, 仍未返回={}", key, stuck);
            for part in parts.iter_mut().filter(|p| p.status == PartStatus::InFlight) {
                part.fail(format!("等待超时 ({:?})", self.request_timeout));
            }
        }
    }

    fn submit(
        &self,
        part: &mut UploadPart,
        path: &Path,
        key: &DestinationKey,
        tx: mpsc::UnboundedSender<PartEvent>,
    ) {
        part.begin_attempt();
        debug!(
            "提交分片#{}: part_number={}, range={:?}, attempt={}",
            part.index,
            part.part_number,
            part.range(),
            part.attempt
        );

        let job = PartJob {
            index: part.index,
            attempt: part.attempt,
            path: path.to_path_buf(),
            offset: part.offset,
            size: part.size,
            request: PartRequest {
                key: key.clone(),
                part_number: part.part_number,
                checksum: part.md5.clone().unwrap_or_default(),
            },
            md5: part.md5.clone(),
            target: part.target.clone(),
        };
        let backend = self.backend.clone();
        let request_timeout = self.request_timeout;

        tokio::spawn(async move {
            let (index, attempt) = (job.index, job.attempt);
            let result = tokio::time::timeout(
                request_timeout,
                AssertUnwindSafe(upload_one(backend, job)).catch_unwind(),
            )
            .await;

            let event = match result {
                Ok(Ok(event)) => event,
                Ok(Err(_)) => PartEvent::error(index, attempt, "上传任务异常退出"),
                Err(_) => PartEvent::error(
                    index,
                    attempt,
                    format!("请求超时 ({:?})", request_timeout),
                ),
            };
            // 协调任务已结束时结果无人接收
            let _ = tx.send(event);
        });
    }
}

fn count_in_flight(parts: &[UploadPart]) -> usize {
    parts
        .iter()
        .filter(|p| p.status == PartStatus::InFlight)
        .count()
}

/// 处理一个上传结果
fn observe(parts: &mut [UploadPart], event: PartEvent) {
    let Some(part) = parts.get_mut(event.index) else {
        return;
    };
    if part.status != PartStatus::InFlight || part.attempt != event.attempt {
        debug!("丢弃过期结果: 分片#{}, attempt={}", event.index, event.attempt);
        return;
    }

    if part.md5.is_none() {
        part.md5 = event.md5;
    }
    if event.target.is_some() {
        part.target = event.target;
    }

    match part.apply(event.outcome) {
        PartStatus::Available => debug!("分片#{} 上传成功", part.index),
        PartStatus::Pending => warn!(
            "分片#{} 首次上传未授权，等待令牌续期后重试",
            part.index
        ),
        PartStatus::Failed => error!(
            "分片#{} 上传失败: {}",
            part.index,
            part.error.as_deref().unwrap_or("")
        ),
        PartStatus::InFlight => {}
    }
}

/// 上传单个分片：读取数据、计算 MD5、获取上传地址、发送
async fn upload_one(backend: Arc<dyn UploadBackend>, mut job: PartJob) -> PartEvent {
    let data = match read_chunk(&job.path, job.offset, job.size).await {
        Ok(data) => data,
        Err(e) => {
            return PartEvent::error(job.index, job.attempt, format!("读取分片失败: {}", e));
        }
    };

    let md5 = job.md5.take().unwrap_or_else(|| md5_bytes(&data));
    job.request.checksum = md5.clone();

    let target = match job.target.take() {
        Some(target) => Some(target),
        None => match backend.part_target(&job.request).await {
            Ok(target) => target,
            Err(e) => {
                let mut event = PartEvent::error(
                    job.index,
                    job.attempt,
                    format!("获取上传地址失败: {}", e),
                );
                event.md5 = Some(md5);
                return event;
            }
        },
    };

    let outcome = match backend.upload_part(&job.request, target.as_ref(), data).await {
        Ok(RawResponse { status, body }) => PartOutcome::Response { status, body },
        Err(e) => PartOutcome::Error(e.to_string()),
    };

    PartEvent {
        index: job.index,
        attempt: job.attempt,
        md5: Some(md5),
        target,
        outcome,
    }
}

/// 读取文件的一段（每次独立打开文件，不共享读取位置）
async fn read_chunk(path: &Path, offset: u64, size: u64) -> std::io::Result<Vec<u8>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let file_len = file.metadata()?.len();
        let in_range = offset
            .checked_add(size)
            .map_or(false, |end| end <= file_len);
        if !in_range {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "读取范围超出文件: offset={}, size={}, 文件大小={}",
                    offset, size, file_len
                ),
            ));
        }
        let len = usize::try_from(size)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadStrategy;
    use crate::uploader::chunk::{ChunkLimits, ChunkPlanner};
    use crate::uploader::testing::MockBackend;
    use std::io::Write;
    use std::sync::atomic::Ordering;

    const KIB: u64 = 1024;

    /// 写入内容可区分的测试文件
    fn temp_file(size: u64) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    /// 小分片规划，避免测试写入大文件
    fn chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkSpec> {
        let limits = ChunkLimits::new(KIB, 64 * KIB, 1000).unwrap();
        ChunkPlanner::new(limits)
            .plan(file_size, chunk_size)
            .unwrap()
            .chunks
    }

    fn key() -> DestinationKey {
        DestinationKey::new("ds-1", "raster")
    }

    fn scheduler(backend: &Arc<MockBackend>, max: usize, timeout: Duration) -> PartScheduler {
        PartScheduler::new(backend.clone() as Arc<dyn UploadBackend>, max, timeout)
    }

    #[tokio::test]
    async fn test_read_chunk_range() {
        let file = temp_file(10 * KIB);
        let content = std::fs::read(file.path()).unwrap();

        let data = read_chunk(file.path(), 4 * KIB, 2 * KIB).await.unwrap();
        assert_eq!(data, content[4096..6144].to_vec());

        let tail = read_chunk(file.path(), 8 * KIB, 2 * KIB).await.unwrap();
        assert_eq!(tail, content[8192..].to_vec());
    }

    #[tokio::test]
    async fn test_read_chunk_out_of_range() {
        let file = temp_file(10 * KIB);

        let err = read_chunk(file.path(), 8 * KIB, 4 * KIB).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        // 不会按请求大小分配缓冲区
        let err = read_chunk(file.path(), 0, u64::MAX).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        let err = read_chunk(file.path(), u64::MAX, 2).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_huge_request_timeout() {
        let file = temp_file(10 * KIB);
        let backend = Arc::new(MockBackend::new(UploadStrategy::Direct));

        let report = scheduler(&backend, 4, Duration::MAX)
            .run(file.path(), &key(), &chunks(10 * KIB, 4 * KIB))
            .await;

        assert!(report.is_success());
        assert_eq!(MockBackend::count(&backend.part_calls), 3);
    }

    #[tokio::test]
    async fn test_all_parts_available() {
        let file = temp_file(10 * KIB);
        let backend = Arc::new(MockBackend::new(UploadStrategy::Direct));

        let report = scheduler(&backend, 4, Duration::from_secs(5))
            .run(file.path(), &key(), &chunks(10 * KIB, 4 * KIB))
            .await;

        assert!(report.is_success());
        assert_eq!(report.parts.len(), 3);
        assert_eq!(report.requests, 3);
        assert!(report.failures().is_empty());
        assert_eq!(MockBackend::count(&backend.part_calls), 3);

        let mut sizes: Vec<(u32, usize)> = backend
            .received
            .lock()
            .iter()
            .map(|p| (p.part_number, p.len))
            .collect();
        sizes.sort();
        assert_eq!(sizes, vec![(1, 4096), (2, 4096), (3, 2048)]);
    }

    #[tokio::test]
    async fn test_part_checksums_match_file_ranges() {
        let file = temp_file(10 * KIB);
        let content = std::fs::read(file.path()).unwrap();
        let backend = Arc::new(MockBackend::new(UploadStrategy::Legacy));

        let report = scheduler(&backend, 2, Duration::from_secs(5))
            .run(file.path(), &key(), &chunks(10 * KIB, 4 * KIB))
            .await;

        assert!(report.is_success());
        for part in &report.parts {
            let range = part.range();
            let expected = md5_bytes(&content[range.start as usize..range.end as usize]);
            assert_eq!(part.md5.as_deref(), Some(expected.as_str()));
        }
        // legacy 方式不申请上传地址
        assert!(backend.received.lock().iter().all(|p| p.target.is_none()));
    }

    #[tokio::test]
    async fn test_first_401_is_retried_once_with_single_renewal() {
        let file = temp_file(10 * KIB);
        let backend = Arc::new(MockBackend::new(UploadStrategy::Direct).with_statuses(2, &[401, 200]));

        let report = scheduler(&backend, 3, Duration::from_secs(5))
            .run(file.path(), &key(), &chunks(10 * KIB, 4 * KIB))
            .await;

        assert!(report.is_success());
        assert_eq!(report.requests, 4);
        assert_eq!(report.parts[1].attempt, 2);
        assert_eq!(report.parts[0].attempt, 1);
        assert_eq!(backend.attempts_for(2), 2);
        assert_eq!(backend.tokens.renewals(), 1);
        // 重试复用缓存的上传地址
        assert_eq!(MockBackend::count(&backend.target_calls), 3);
    }

    #[tokio::test]
    async fn test_second_401_fails_part() {
        let file = temp_file(10 * KIB);
        let backend = Arc::new(MockBackend::new(UploadStrategy::Direct).with_statuses(1, &[401, 401]));

        let report = scheduler(&backend, 3, Duration::from_secs(5))
            .run(file.path(), &key(), &chunks(10 * KIB, 4 * KIB))
            .await;

        assert!(!report.is_success());
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 0);
        assert_eq!(failures[0].attempts, 2);
        assert!(failures[0].reason.contains("401"));
    }

    #[tokio::test]
    async fn test_server_error_fails_without_retry() {
        let file = temp_file(10 * KIB);
        let backend = Arc::new(MockBackend::new(UploadStrategy::Direct).with_statuses(2, &[500]));

        let report = scheduler(&backend, 3, Duration::from_secs(5))
            .run(file.path(), &key(), &chunks(10 * KIB, 4 * KIB))
            .await;

        assert!(!report.is_success());
        assert_eq!(report.parts[0].status, PartStatus::Available);
        assert_eq!(report.parts[1].status, PartStatus::Failed);
        assert_eq!(report.parts[2].status, PartStatus::Available);
        assert_eq!(backend.attempts_for(2), 1);
        assert_eq!(backend.tokens.renewals(), 0);

        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 1);
        assert_eq!(failures[0].part_number, 2);
        assert!(failures[0].reason.contains("500"));
    }

    #[tokio::test]
    async fn test_outstanding_requests_never_exceed_limit() {
        let file = temp_file(40 * KIB);
        let backend = Arc::new(
            MockBackend::new(UploadStrategy::Legacy).with_delay(Duration::from_millis(20)),
        );

        let report = scheduler(&backend, 3, Duration::from_secs(5))
            .run(file.path(), &key(), &chunks(40 * KIB, 2 * KIB))
            .await;

        assert!(report.is_success());
        assert_eq!(report.parts.len(), 20);
        assert!(report.max_outstanding <= 3);
        let observed = backend.max_in_flight.load(Ordering::SeqCst);
        assert!(observed <= 3, "并发请求数 {} 超过上限", observed);
        assert!(observed >= 2);
    }

    #[tokio::test]
    async fn test_hung_request_times_out() {
        let file = temp_file(10 * KIB);
        let backend = Arc::new(
            MockBackend::new(UploadStrategy::Legacy).with_part_delay(2, Duration::from_secs(30)),
        );

        let report = scheduler(&backend, 3, Duration::from_millis(200))
            .run(file.path(), &key(), &chunks(10 * KIB, 4 * KIB))
            .await;

        assert!(!report.is_success());
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].part_number, 2);
        assert!(failures[0].reason.contains("超时"));
    }

    #[tokio::test]
    async fn test_missing_file_fails_every_part() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new(UploadStrategy::Legacy));

        let report = scheduler(&backend, 2, Duration::from_secs(5))
            .run(&dir.path().join("gone.bin"), &key(), &chunks(10 * KIB, 4 * KIB))
            .await;

        assert_eq!(report.failures().len(), 3);
        assert_eq!(MockBackend::count(&backend.part_calls), 0);
    }

    #[test]
    fn test_stale_event_is_ignored() {
        let mut parts: Vec<UploadPart> = chunks(10 * KIB, 4 * KIB)
            .into_iter()
            .map(UploadPart::new)
            .collect();
        parts[0].begin_attempt();
        parts[0].fail("等待超时");

        observe(
            &mut parts,
            PartEvent {
                index: 0,
                attempt: 1,
                md5: None,
                target: None,
                outcome: PartOutcome::Response {
                    status: 200,
                    body: String::new(),
                },
            },
        );
        assert_eq!(parts[0].status, PartStatus::Failed);
    }
}
