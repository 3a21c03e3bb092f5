//! 访问令牌管理
//!
//! 多个并发请求同时收到 401 时只允许一次续期：
//! 请求发出前记录令牌代数（generation），收到 401 后在续期锁内比较，
//! 代数已变化说明其他请求刚刚完成续期，直接复用新令牌

use crate::auth::types::{Credentials, Token};
use crate::error::{Result, UploadError};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 令牌接口路径
pub const TOKEN_PATH: &str = "/dxauth/oauth/token";

/// 令牌来源
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// 获取新的访问令牌
    async fn fetch_token(&self) -> Result<Token>;
}

/// OAuth 令牌来源
pub struct OAuthTokenSource {
    client: Client,
    token_url: String,
    credentials: Credentials,
}

impl OAuthTokenSource {
    pub fn new(client: Client, base_url: &str, credentials: Credentials) -> Self {
        Self {
            client,
            token_url: format!("{}{}", base_url.trim_end_matches('/'), TOKEN_PATH),
            credentials,
        }
    }
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn fetch_token(&self) -> Result<Token> {
        debug!("请求新令牌: {}", self.token_url);

        let response = self
            .client
            .post(&self.token_url)
            .header(
                "Authorization",
                format!("Basic {}", self.credentials.encoded_secret()),
            )
            .json(self.credentials.data())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            error!("令牌请求失败: status={}, body={}", status, body);
            return Err(UploadError::TokenRenewal(format!("HTTP {}: {}", status, body)));
        }

        let value: Value = serde_json::from_str(&body)?;
        if value.get("access_token").is_none() {
            error!("不支持的令牌响应: {}", body);
            return Err(UploadError::TokenRenewal("响应中缺少 access_token".to_string()));
        }

        let token: Token = serde_json::from_value(value)?;
        debug!("获取新令牌成功");
        Ok(token)
    }
}

#[derive(Debug, Default)]
struct TokenState {
    token: Option<Token>,
    generation: u64,
}

/// 令牌管理器
pub struct TokenManager {
    /// 令牌来源（无凭证时为 None，不做续期）
    source: Option<Arc<dyn TokenSource>>,
    /// 当前令牌与代数
    state: RwLock<TokenState>,
    /// 续期锁：同一时刻只有一个续期判断
    renew_lock: Mutex<()>,
    /// 累计续期次数
    renewals: AtomicU64,
}

impl TokenManager {
    pub fn new(source: Option<Arc<dyn TokenSource>>, initial: Option<Token>) -> Self {
        Self {
            source,
            state: RwLock::new(TokenState {
                token: initial,
                generation: 0,
            }),
            renew_lock: Mutex::new(()),
            renewals: AtomicU64::new(0),
        }
    }

    /// 使用固定令牌，不做续期
    pub fn with_static_token(token: Token) -> Self {
        Self::new(None, Some(token))
    }

    /// 当前 Authorization 头的值及其代数
    pub fn authorization(&self) -> (Option<String>, u64) {
        let state = self.state.read();
        (
            state.token.as_ref().map(Token::header_value),
            state.generation,
        )
    }

    /// 当前代数
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// 累计续期次数
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::SeqCst)
    }

    /// 无条件续期（首次请求前获取令牌）
    pub async fn renew(&self) -> Result<bool> {
        let seen = self.generation();
        self.renew_if_stale(seen).await
    }

    /// 令牌仍是 `seen_generation` 那一代时才续期
    ///
    /// # 返回
    /// - `Ok(true)`: 本次调用完成了续期
    /// - `Ok(false)`: 已被其他请求续期，或没有凭证
    pub async fn renew_if_stale(&self, seen_generation: u64) -> Result<bool> {
        let _guard = self.renew_lock.lock().await;

        if self.generation() != seen_generation {
            debug!("令牌已续期，跳过");
            return Ok(false);
        }

        let Some(source) = &self.source else {
            warn!("令牌续期需要凭证");
            return Ok(false);
        };

        info!("令牌失效，开始续期");
        let token = source.fetch_token().await?;
        {
            let mut state = self.state.write();
            state.token = Some(token);
            state.generation += 1;
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);
        info!("令牌续期完成");
        Ok(true)
    }
}
