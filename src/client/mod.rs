// 平台连接模块

pub mod connection;
pub mod types;

#[cfg(test)]
pub(crate) mod test_server;

pub use connection::Connection;
pub use types::{CreateTransferAck, RawResponse, UploadTargetResponse};
