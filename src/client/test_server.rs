// 测试用的本地 HTTP 服务
//
// 只实现测试需要的 HTTP/1.1 子集：读取请求头和 Content-Length 指定的请求体，
// 记录请求后按回调返回状态码，每个连接只处理一个请求

use crate::auth::{Token, TokenManager, TokenSource};
use crate::client::Connection;
use crate::config::ConnectionConfig;
use crate::uploader::testing::RenewingSource;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// 服务端收到的请求
#[derive(Debug, Clone)]
pub(crate) struct CapturedRequest {
    pub method: String,
    /// 路径和查询字符串
    pub target: String,
    pub authorization: Option<String>,
    pub body_len: usize,
}

type Responder = Arc<dyn Fn(&CapturedRequest) -> (u16, String) + Send + Sync>;

pub(crate) struct TestServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl TestServer {
    pub async fn spawn<F>(responder: F) -> Self
    where
        F: Fn(&CapturedRequest) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let responder: Responder = Arc::new(responder);

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = recorded.clone();
                let responder = responder.clone();
                tokio::spawn(async move {
                    let _ = handle(stream, recorded, responder).await;
                });
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().len()
    }
}

async fn handle(
    mut stream: TcpStream,
    recorded: Arc<Mutex<Vec<CapturedRequest>>>,
    responder: Responder,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();

    let mut authorization = None;
    let mut content_length = 0usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("authorization") {
            authorization = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().unwrap_or(0);
        }
    }

    let mut body_len = buf.len() - header_end;
    while body_len < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body_len += n;
    }

    let request = CapturedRequest {
        method,
        target,
        authorization,
        body_len,
    };
    let (status, body) = responder(&request);
    recorded.lock().push(request);

    let reason = match status {
        200 => "OK",
        401 => "Unauthorized",
        500 => "Internal Server Error",
        _ => "Status",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// 持有旧令牌的连接，续期后令牌依次为 renewed-1、renewed-2 ...
pub(crate) fn stale_token_connection(base_url: &str) -> (Connection, Arc<TokenManager>) {
    let source = Arc::new(RenewingSource {
        calls: AtomicUsize::new(0),
    });
    let tokens = Arc::new(TokenManager::new(
        Some(source as Arc<dyn TokenSource>),
        Some(Token {
            access_token: "old".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: None,
            refresh_token: None,
        }),
    ));
    let config = ConnectionConfig {
        base_url: base_url.to_string(),
        ..Default::default()
    };
    // 本地服务不走系统代理
    let client = Client::builder().no_proxy().build().unwrap();
    let connection = Connection::with_client(client, &config, tokens.clone()).unwrap();
    (connection, tokens)
}

/// 只接受续期后令牌的响应回调
pub(crate) fn accept_renewed(request: &CapturedRequest) -> (u16, String) {
    match request.authorization.as_deref() {
        Some("Bearer renewed-1") => (200, r#"{"total_parts": 3}"#.to_string()),
        _ => (401, r#"{"error": "invalid_token"}"#.to_string()),
    }
}
