// 测试用的内存上传协议

use crate::auth::{Token, TokenManager, TokenSource};
use crate::client::{CreateTransferAck, RawResponse};
use crate::config::UploadStrategy;
use crate::error::Result;
use crate::uploader::backend::{
    CreateTransferRequest, PartRequest, PartUploadTarget, SingleShotRequest, UploadBackend,
};
use crate::uploader::element::DestinationKey;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 每次续期返回新令牌
pub(crate) struct RenewingSource {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TokenSource for RenewingSource {
    async fn fetch_token(&self) -> Result<Token> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Token {
            access_token: format!("renewed-{}", n),
            token_type: "Bearer".to_string(),
            expires_in: None,
            refresh_token: None,
        })
    }
}

/// 服务端收到的分片
#[derive(Debug, Clone)]
pub(crate) struct ReceivedPart {
    pub part_number: u32,
    pub len: usize,
    pub checksum: String,
    pub target: Option<String>,
}

pub(crate) struct MockBackend {
    strategy: UploadStrategy,
    /// 按分片号预设的响应状态，依次消费，用完后返回 200
    statuses: Mutex<HashMap<u32, VecDeque<u16>>>,
    delay: Duration,
    part_delays: HashMap<u32, Duration>,
    fail_create: bool,
    pub tokens: Arc<TokenManager>,
    pub source: Arc<RenewingSource>,
    pub creates: AtomicUsize,
    pub completes: AtomicUsize,
    pub single_shots: AtomicUsize,
    pub target_calls: AtomicUsize,
    pub part_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub received: Mutex<Vec<ReceivedPart>>,
    pub created: Mutex<Vec<CreateTransferRequest>>,
    pub single_shot_requests: Mutex<Vec<(SingleShotRequest, usize)>>,
}

impl MockBackend {
    pub fn new(strategy: UploadStrategy) -> Self {
        let source = Arc::new(RenewingSource {
            calls: AtomicUsize::new(0),
        });
        let tokens = Arc::new(TokenManager::new(
            Some(source.clone() as Arc<dyn TokenSource>),
            None,
        ));
        Self {
            strategy,
            statuses: Mutex::new(HashMap::new()),
            delay: Duration::from_millis(5),
            part_delays: HashMap::new(),
            fail_create: false,
            tokens,
            source,
            creates: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
            single_shots: AtomicUsize::new(0),
            target_calls: AtomicUsize::new(0),
            part_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            single_shot_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_statuses(self, part_number: u32, statuses: &[u16]) -> Self {
        self.statuses
            .lock()
            .insert(part_number, statuses.iter().copied().collect());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_part_delay(mut self, part_number: u32, delay: Duration) -> Self {
        self.part_delays.insert(part_number, delay);
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// 某个分片收到的请求次数
    pub fn attempts_for(&self, part_number: u32) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|p| p.part_number == part_number)
            .count()
    }
}

#[async_trait]
impl UploadBackend for MockBackend {
    fn strategy(&self) -> UploadStrategy {
        self.strategy
    }

    async fn create_transfer(&self, request: &CreateTransferRequest) -> Result<CreateTransferAck> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(crate::error::UploadError::Http {
                status: 403,
                url: "create-multipart-upload".to_string(),
                body: "forbidden".to_string(),
            });
        }
        let total_parts = request.total_size.div_ceil(request.chunk_size);
        self.created.lock().push(request.clone());
        Ok(CreateTransferAck {
            total_parts: Some(total_parts),
        })
    }

    async fn part_target(&self, request: &PartRequest) -> Result<Option<PartUploadTarget>> {
        if self.strategy == UploadStrategy::Legacy {
            return Ok(None);
        }
        self.target_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(PartUploadTarget {
            url: format!(
                "https://bucket.example.com/{}/part-{}",
                request.key.component, request.part_number
            ),
            headers: HashMap::new(),
        }))
    }

    async fn upload_part(
        &self,
        request: &PartRequest,
        target: Option<&PartUploadTarget>,
        data: Vec<u8>,
    ) -> Result<RawResponse> {
        self.part_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (_, generation) = self.tokens.authorization();
        let delay = self
            .part_delays
            .get(&request.part_number)
            .copied()
            .unwrap_or(self.delay);
        tokio::time::sleep(delay).await;

        let status = self
            .statuses
            .lock()
            .get_mut(&request.part_number)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(200);
        self.received.lock().push(ReceivedPart {
            part_number: request.part_number,
            len: data.len(),
            checksum: request.checksum.clone(),
            target: target.map(|t| t.url.clone()),
        });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if status == 401 {
            self.tokens.renew_if_stale(generation).await?;
        }

        Ok(RawResponse {
            status,
            body: if status >= 400 {
                format!("error {}", status)
            } else {
                String::new()
            },
        })
    }

    async fn complete_transfer(&self, _key: &DestinationKey) -> Result<()> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upload_single_shot(&self, request: &SingleShotRequest, data: Vec<u8>) -> Result<()> {
        self.single_shots.fetch_add(1, Ordering::SeqCst);
        self.single_shot_requests
            .lock()
            .push((request.clone(), data.len()));
        Ok(())
    }
}
