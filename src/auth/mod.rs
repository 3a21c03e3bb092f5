// 认证模块

pub mod token;
pub mod types;

pub use token::{OAuthTokenSource, TokenManager, TokenSource, TOKEN_PATH};
pub use types::{Credentials, CredentialsConfig, Token};
