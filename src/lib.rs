// Dataset Uploader Library
// 数据集组件分片上传客户端核心库

// 认证模块
pub mod auth;

// 平台连接模块
pub mod client;

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use auth::{Credentials, Token, TokenManager};
pub use client::Connection;
pub use config::{AppConfig, UploadStrategy};
pub use error::{PartFailure, Result, UploadError};
pub use uploader::{DatasetUploader, DestinationKey, UploadOptions};
