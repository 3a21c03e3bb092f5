//! 上传协议
//!
//! 两种上传方式共用同一套调度逻辑，差别只在远端接口：
//! - direct: 向服务申请签名地址，数据直接 PUT 到对象存储
//! - legacy: 数据经数据管理服务中转

use crate::client::{Connection, CreateTransferAck, RawResponse, UploadTargetResponse};
use crate::config::UploadStrategy;
use crate::error::{Result, UploadError};
use crate::uploader::element::{
    encode_query, DestinationKey, COMPLETE_MULTIPART_ROUTE, COMPLETE_UPLOAD_ROUTE,
    CREATE_MULTIPART_ROUTE, GET_PART_ROUTE, INIT_UPLOAD_ROUTE, LEGACY_UPLOAD_PART_ROUTE,
    LEGACY_UPLOAD_ROUTE,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// 分片上传地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUploadTarget {
    /// 签名地址
    pub url: String,
    /// 需要附带的请求头
    pub headers: HashMap<String, String>,
}

impl From<UploadTargetResponse> for PartUploadTarget {
    fn from(resp: UploadTargetResponse) -> Self {
        Self {
            url: resp.put_url,
            headers: resp.headers,
        }
    }
}

/// 创建分片传输请求
#[derive(Debug, Clone)]
pub struct CreateTransferRequest {
    pub key: DestinationKey,
    pub filename: String,
    pub chunk_size: u64,
    pub total_size: u64,
    /// 整个文件的 MD5
    pub checksum: String,
}

/// 单次上传请求
#[derive(Debug, Clone)]
pub struct SingleShotRequest {
    pub key: DestinationKey,
    pub filename: String,
    pub checksum: String,
}

/// 单个分片请求
#[derive(Debug, Clone)]
pub struct PartRequest {
    pub key: DestinationKey,
    pub part_number: u32,
    pub checksum: String,
}

/// 远端上传协议
#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// 上传方式
    fn strategy(&self) -> UploadStrategy;

    /// 创建分片传输
    async fn create_transfer(&self, request: &CreateTransferRequest) -> Result<CreateTransferAck>;

    /// 获取分片上传地址
    ///
    /// 返回 `None` 表示分片直接传给服务，无需额外地址
    async fn part_target(&self, request: &PartRequest) -> Result<Option<PartUploadTarget>>;

    /// 上传单个分片
    ///
    /// 服务端的任何响应都原样返回，由调度器判断状态；只有请求未能完成时返回错误
    async fn upload_part(
        &self,
        request: &PartRequest,
        target: Option<&PartUploadTarget>,
        data: Vec<u8>,
    ) -> Result<RawResponse>;

    /// 完成分片传输
    async fn complete_transfer(&self, key: &DestinationKey) -> Result<()>;

    /// 单次上传整个文件
    async fn upload_single_shot(&self, request: &SingleShotRequest, data: Vec<u8>) -> Result<()>;
}

fn create_payload(request: &CreateTransferRequest, direct_upload: bool) -> Value {
    let mut payload = request.key.value();
    payload.insert("filename".to_string(), Value::from(request.filename.as_str()));
    payload.insert("chunk_size".to_string(), Value::from(request.chunk_size));
    payload.insert("total_size".to_string(), Value::from(request.total_size));
    payload.insert("checksum".to_string(), Value::from(request.checksum.as_str()));
    if direct_upload {
        payload.insert("direct_upload".to_string(), Value::Bool(true));
    }
    Value::Object(payload)
}

fn route(root: &str, name: &str) -> String {
    format!("{}/{}", root.trim_matches('/'), name)
}

async fn complete_multipart(connection: &Connection, root: &str, key: &DestinationKey) -> Result<()> {
    let _: Value = connection
        .post_json(
            &route(root, COMPLETE_MULTIPART_ROUTE),
            &Value::Object(key.value()),
        )
        .await?;
    info!("分片传输已完成: {}", key);
    Ok(())
}

/// 签名地址直传
pub struct DirectBackend {
    connection: Arc<Connection>,
    root: String,
}

impl DirectBackend {
    pub fn new(connection: Arc<Connection>, root: impl Into<String>) -> Self {
        Self {
            connection,
            root: root.into(),
        }
    }
}

#[async_trait]
impl UploadBackend for DirectBackend {
    fn strategy(&self) -> UploadStrategy {
        UploadStrategy::Direct
    }

    async fn create_transfer(&self, request: &CreateTransferRequest) -> Result<CreateTransferAck> {
        let ack: CreateTransferAck = self
            .connection
            .post_json(
                &route(&self.root, CREATE_MULTIPART_ROUTE),
                &create_payload(request, true),
            )
            .await?;
        debug!("创建分片传输: {}, total_parts={:?}", request.key, ack.total_parts);
        Ok(ack)
    }

    async fn part_target(&self, request: &PartRequest) -> Result<Option<PartUploadTarget>> {
        let mut payload = request.key.value();
        payload.insert("part_number".to_string(), Value::from(request.part_number));
        payload.insert("checksum".to_string(), Value::from(request.checksum.as_str()));

        let resp: UploadTargetResponse = self
            .connection
            .post_json(&route(&self.root, GET_PART_ROUTE), &Value::Object(payload))
            .await?;
        Ok(Some(resp.into()))
    }

    async fn upload_part(
        &self,
        request: &PartRequest,
        target: Option<&PartUploadTarget>,
        data: Vec<u8>,
    ) -> Result<RawResponse> {
        let target = target.ok_or_else(|| {
            UploadError::Validation(format!("分片 {} 缺少上传地址", request.part_number))
        })?;
        self.connection
            .put_external(&target.url, &target.headers, data)
            .await
    }

    async fn complete_transfer(&self, key: &DestinationKey) -> Result<()> {
        complete_multipart(&self.connection, &self.root, key).await
    }

    async fn upload_single_shot(&self, request: &SingleShotRequest, data: Vec<u8>) -> Result<()> {
        let mut payload = request.key.value();
        payload.insert("filename".to_string(), Value::from(request.filename.as_str()));
        payload.insert("checksum".to_string(), Value::from(request.checksum.as_str()));

        let target: PartUploadTarget = self
            .connection
            .post_json::<UploadTargetResponse>(
                &route(&self.root, INIT_UPLOAD_ROUTE),
                &Value::Object(payload),
            )
            .await?
            .into();

        let response = self
            .connection
            .put_external(&target.url, &target.headers, data)
            .await?;
        if !response.is_success() {
            return Err(UploadError::Http {
                status: response.status,
                url: target.url,
                body: response.body,
            });
        }

        let _: Value = self
            .connection
            .post_json(
                &route(&self.root, COMPLETE_UPLOAD_ROUTE),
                &Value::Object(request.key.value()),
            )
            .await?;
        Ok(())
    }
}

/// 经数据管理服务中转
pub struct LegacyBackend {
    connection: Arc<Connection>,
    root: String,
}

impl LegacyBackend {
    pub fn new(connection: Arc<Connection>, root: impl Into<String>) -> Self {
        Self {
            connection,
            root: root.into(),
        }
    }

    fn part_path(&self, request: &PartRequest) -> String {
        let mut pairs = request.key.query_pairs();
        pairs.push(("part_number", request.part_number.to_string()));
        pairs.push(("checksum", request.checksum.clone()));
        format!(
            "{}?{}",
            route(&self.root, LEGACY_UPLOAD_PART_ROUTE),
            encode_query(&pairs)
        )
    }

    fn single_shot_path(&self, request: &SingleShotRequest) -> String {
        let mut pairs = vec![
            ("filename", request.filename.clone()),
            ("checksum", request.checksum.clone()),
        ];
        pairs.extend(request.key.query_pairs());
        format!(
            "{}?{}",
            route(&self.root, LEGACY_UPLOAD_ROUTE),
            encode_query(&pairs)
        )
    }
}

#[async_trait]
impl UploadBackend for LegacyBackend {
    fn strategy(&self) -> UploadStrategy {
        UploadStrategy::Legacy
    }

    async fn create_transfer(&self, request: &CreateTransferRequest) -> Result<CreateTransferAck> {
        let ack: CreateTransferAck = self
            .connection
            .post_json(
                &route(&self.root, CREATE_MULTIPART_ROUTE),
                &create_payload(request, false),
            )
            .await?;
        debug!("创建分片传输: {}, total_parts={:?}", request.key, ack.total_parts);
        Ok(ack)
    }

    async fn part_target(&self, _request: &PartRequest) -> Result<Option<PartUploadTarget>> {
        Ok(None)
    }

    async fn upload_part(
        &self,
        request: &PartRequest,
        _target: Option<&PartUploadTarget>,
        data: Vec<u8>,
    ) -> Result<RawResponse> {
        self.connection
            .post_part(&self.part_path(request), data)
            .await
    }

    async fn complete_transfer(&self, key: &DestinationKey) -> Result<()> {
        complete_multipart(&self.connection, &self.root, key).await
    }

    async fn upload_single_shot(&self, request: &SingleShotRequest, data: Vec<u8>) -> Result<()> {
        self.connection
            .post_bytes(&self.single_shot_path(request), data)
            .await?;
        Ok(())
    }
}

/// 按上传方式创建协议实现
pub fn backend_for(
    strategy: UploadStrategy,
    connection: Arc<Connection>,
    root: &str,
) -> Arc<dyn UploadBackend> {
    match strategy {
        UploadStrategy::Direct => Arc::new(DirectBackend::new(connection, root)),
        UploadStrategy::Legacy => Arc::new(LegacyBackend::new(connection, root)),
    }
}
