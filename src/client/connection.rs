//! 平台连接
//!
//! 负责给请求附加认证头，并在 401 时触发令牌续期。
//! 认证头只发给平台自身的主机，签名上传地址（对象存储）不带认证头

use crate::auth::{Credentials, OAuthTokenSource, TokenManager, TokenSource, TOKEN_PATH};
use crate::client::types::RawResponse;
use crate::config::ConnectionConfig;
use crate::error::{Result, UploadError};
use reqwest::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 平台连接
pub struct Connection {
    /// HTTP客户端
    client: Client,
    /// 平台地址
    base_url: Url,
    /// 令牌管理器
    tokens: Arc<TokenManager>,
    /// 单个请求超时
    request_timeout: Duration,
    /// 并发请求数上限
    max_request_workers: usize,
    user_agent: String,
}

impl Connection {
    /// 根据配置创建连接（不发起网络请求）
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        let source = config.credentials.as_ref().map(|creds| {
            Arc::new(OAuthTokenSource::new(
                client.clone(),
                &config.base_url,
                Credentials::from(creds),
            )) as Arc<dyn TokenSource>
        });
        if source.is_none() {
            warn!("未配置凭证，请求将不带认证头");
        }

        Self::with_client(client, config, Arc::new(TokenManager::new(source, None)))
    }

    /// 使用已有的令牌管理器创建连接
    pub fn with_tokens(config: &ConnectionConfig, tokens: Arc<TokenManager>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Self::with_client(client, config, tokens)
    }

    pub(crate) fn with_client(
        client: Client,
        config: &ConnectionConfig,
        tokens: Arc<TokenManager>,
    ) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            UploadError::Configuration(format!("无效的平台地址 {}: {}", config.base_url, e))
        })?;

        let user_agent = match &config.user_agent {
            Some(extra) => format!("{} {}", default_user_agent(), extra),
            None => default_user_agent(),
        };

        Ok(Self {
            client,
            base_url,
            tokens,
            request_timeout: config.request_timeout(),
            max_request_workers: config.max_request_workers,
            user_agent,
        })
    }

    /// 创建连接并获取首个令牌
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let connection = Self::from_config(config)?;
        if config.credentials.is_some() {
            connection.tokens.renew().await?;
            info!("已连接到平台: {}", connection.base_url);
        }
        Ok(connection)
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn max_request_workers(&self) -> usize {
        self.max_request_workers
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// 平台接口的完整地址
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// 是否给该地址附加认证头
    fn should_authorize(&self, url: &Url) -> bool {
        url.host_str() == self.base_url.host_str()
            && url.port_or_known_default() == self.base_url.port_or_known_default()
            && !url.path().ends_with(TOKEN_PATH)
    }

    /// 发送请求，收到 401 时续期令牌但不重试
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<RawResponse> {
        let (response, _) = self.send_once(method, url, headers, body).await?;
        Ok(response)
    }

    /// 发送一次请求，返回响应和发送时的令牌代数
    async fn send_once(
        &self,
        method: Method,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<(RawResponse, u64)> {
        let parsed = Url::parse(url)
            .map_err(|e| UploadError::Validation(format!("无效的 URL {}: {}", url, e)))?;
        let authorize = self.should_authorize(&parsed);

        let mut request = self
            .client
            .request(method.clone(), parsed)
            .header(USER_AGENT, self.user_agent.as_str())
            .header(CACHE_CONTROL, "no-cache");
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let (authorization, generation) = self.tokens.authorization();
        if authorize {
            if let Some(value) = authorization {
                request = request.header(AUTHORIZATION, value);
            }
        }

        if let Some(body) = body {
            request = request.body(body);
        }

        debug!("{} {}", method, url);
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!("{} {} -> {}", method, url, status);

        if status == 401 && authorize {
            warn!("请求未授权，尝试续期令牌: {} {}", method, url);
            if let Err(e) = self.tokens.renew_if_stale(generation).await {
                error!("令牌续期失败: {}", e);
            }
        }

        Ok((RawResponse { status, body }, generation))
    }

    /// 发送请求，401 后令牌已更新时重试一次
    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<RawResponse> {
        let (response, generation) = self
            .send_once(method.clone(), url, headers, Some(body.clone()))
            .await?;

        if response.status == 401 && self.tokens.generation() != generation {
            debug!("令牌已更新，重试请求: {} {}", method, url);
            let (retried, _) = self.send_once(method, url, headers, Some(body)).await?;
            return Ok(retried);
        }
        Ok(response)
    }

    /// POST JSON 并解析响应
    ///
    /// 401 后令牌已更新时重试一次，非 2xx 返回 `UploadError::Http`
    pub async fn post_json<T: DeserializeOwned>(&self, path: &str, payload: &Value) -> Result<T> {
        let url = self.url_for(path);
        let body = serde_json::to_vec(payload)?;
        let headers = HashMap::from([(CONTENT_TYPE.to_string(), "application/json".to_string())]);

        let response = self
            .send_with_retry(Method::POST, &url, &headers, body)
            .await?;
        let response = ensure_success("POST", url, response)?;
        parse_json(&response.body)
    }

    /// POST 原始字节到平台接口（path 可带查询字符串）
    ///
    /// 与 `post_json` 相同的续期重试，非 2xx 返回 `UploadError::Http`
    pub async fn post_bytes(&self, path: &str, body: Vec<u8>) -> Result<RawResponse> {
        let url = self.url_for(path);
        let response = self
            .send_with_retry(Method::POST, &url, &octet_stream_headers(), body)
            .await?;
        ensure_success("POST", url, response)
    }

    /// POST 单个分片到平台接口，不重试
    ///
    /// 401 只触发续期，响应原样返回给调度器
    pub async fn post_part(&self, path: &str, body: Vec<u8>) -> Result<RawResponse> {
        let url = self.url_for(path);
        self.send(Method::POST, &url, &octet_stream_headers(), Some(body))
            .await
    }

    /// PUT 到签名上传地址
    pub async fn put_external(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<RawResponse> {
        self.send(Method::PUT, url, headers, Some(body)).await
    }
}

fn octet_stream_headers() -> HashMap<String, String> {
    HashMap::from([(
        CONTENT_TYPE.to_string(),
        "application/octet-stream".to_string(),
    )])
}

fn ensure_success(method: &str, url: String, response: RawResponse) -> Result<RawResponse> {
    if response.is_success() {
        return Ok(response);
    }
    error!(
        "请求失败: {} {} -> {}, body={}",
        method, url, response.status, response.body
    );
    Err(UploadError::Http {
        status: response.status,
        url,
        body: response.body,
    })
}

fn default_user_agent() -> String {
    format!("dataset-uploader/{}", env!("CARGO_PKG_VERSION"))
}

/// 解析 JSON 响应，空响应按 null 处理
fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T> {
    let body = body.trim();
    let value = if body.is_empty() { "null" } else { body };
    Ok(serde_json::from_str(value)?)
}
