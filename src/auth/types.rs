// 认证模块数据类型定义

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 客户端凭证配置（来自配置文件）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// OAuth 客户端 ID
    pub client_id: String,
    /// OAuth 客户端密钥
    pub client_secret: String,
    /// 用户名（设置后使用 password 授权）
    #[serde(default)]
    pub username: Option<String>,
    /// 密码
    #[serde(default)]
    pub password: Option<String>,
    /// 授权范围
    #[serde(default)]
    pub scope: Option<String>,
}

/// 换取令牌所需的凭证
#[derive(Debug, Clone)]
pub struct Credentials {
    /// base64(client_id:client_secret)，用于 Basic 认证
    encoded_secret: String,
    /// 令牌请求体
    data: Map<String, Value>,
}

impl Credentials {
    /// client_credentials 授权
    pub fn client(client_id: &str, client_secret: &str) -> Self {
        let mut data = Map::new();
        data.insert("grant_type".to_string(), Value::from("client_credentials"));
        Self::with_data(client_id, client_secret, data)
    }

    /// password 授权
    pub fn user(
        client_id: &str,
        client_secret: &str,
        username: &str,
        password: &str,
        scope: Option<&str>,
    ) -> Self {
        let mut data = Map::new();
        data.insert("grant_type".to_string(), Value::from("password"));
        data.insert("username".to_string(), Value::from(username));
        data.insert("password".to_string(), Value::from(password));
        if let Some(scope) = scope {
            data.insert("scope".to_string(), Value::from(scope));
        }
        Self::with_data(client_id, client_secret, data)
    }

    fn with_data(client_id: &str, client_secret: &str, data: Map<String, Value>) -> Self {
        let secret = format!("{}:{}", client_id, client_secret);
        Self {
            encoded_secret: BASE64.encode(secret.as_bytes()),
            data,
        }
    }

    pub fn encoded_secret(&self) -> &str {
        &self.encoded_secret
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }
}

impl From<&CredentialsConfig> for Credentials {
    fn from(config: &CredentialsConfig) -> Self {
        match (&config.username, &config.password) {
            (Some(username), Some(password)) => Credentials::user(
                &config.client_id,
                &config.client_secret,
                username,
                password,
                config.scope.as_deref(),
            ),
            _ => Credentials::client(&config.client_id, &config.client_secret),
        }
    }
}

/// 访问令牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Token {
    /// Authorization 头的值
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}
