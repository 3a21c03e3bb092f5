// 数据管理服务 API 数据类型

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 原始 HTTP 响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// 状态码
    pub status: u16,
    /// 响应内容
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 创建分片传输的响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTransferAck {
    /// 服务端确认的分片数
    #[serde(default)]
    pub total_parts: Option<u64>,
}

/// 上传地址响应（单次上传初始化、获取分片上传地址）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTargetResponse {
    /// 签名上传地址
    pub put_url: String,

    /// 上传时需要附带的请求头
    #[serde(default)]
    pub headers: HashMap<String, String>,
}
