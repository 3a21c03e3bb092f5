use anyhow::{Context, Result};
use clap::Parser;
use dataset_uploader::{
    auth::CredentialsConfig, logging, AppConfig, Connection, DatasetUploader, DestinationKey,
    UploadOptions, UploadStrategy,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 上传本地文件到数据集组件
#[derive(Debug, Parser)]
#[command(name = "dataset-upload", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/app.toml")]
    config: PathBuf,

    /// 数据集 ID
    #[arg(long)]
    dataset: String,

    /// 组件名
    #[arg(long)]
    component: String,

    /// 要上传的文件
    file: PathBuf,

    /// 分片大小 (MB)，覆盖配置文件
    #[arg(long)]
    chunk_size_mb: Option<u64>,

    /// 经数据管理服务中转上传
    #[arg(long)]
    legacy: bool,

    /// 文件小于最大分片时不使用分片上传
    #[arg(long)]
    no_multipart: bool,

    /// 已知的文件 MD5
    #[arg(long)]
    md5: Option<String>,

    /// 平台地址，覆盖配置文件
    #[arg(long, env = "DATASET_UPLOAD_BASE_URL")]
    base_url: Option<String>,

    /// OAuth 客户端 ID
    #[arg(long, env = "DATASET_UPLOAD_CLIENT_ID")]
    client_id: Option<String>,

    /// OAuth 客户端密钥
    #[arg(long, env = "DATASET_UPLOAD_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,
}

/// 加载配置文件，不存在时使用默认配置
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = AppConfig::load_from_file(path)
            .await
            .with_context(|| format!("加载配置失败: {:?}", path))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

/// 命令行参数覆盖配置文件
fn apply_overrides(config: &mut AppConfig, cli: &Cli) -> Result<()> {
    if let Some(base_url) = &cli.base_url {
        config.connection.base_url = base_url.clone();
    }
    if let (Some(client_id), Some(client_secret)) = (&cli.client_id, &cli.client_secret) {
        config.connection.credentials = Some(CredentialsConfig {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            username: None,
            password: None,
            scope: None,
        });
    }
    if let Some(chunk_size_mb) = cli.chunk_size_mb {
        config.upload.chunk_size_mb = chunk_size_mb;
    }
    if cli.legacy {
        config.upload.strategy = UploadStrategy::Legacy;
    }
    if cli.no_multipart {
        config.upload.use_multipart = false;
    }
    config.validate()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, from_file) = load_config(&cli.config).await?;
    apply_overrides(&mut config, &cli)?;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);
    if !from_file {
        warn!("配置文件不存在，使用默认配置: {:?}", cli.config);
    }
    info!("dataset-upload v{} 启动", env!("CARGO_PKG_VERSION"));

    let connection = Arc::new(
        Connection::connect(&config.connection)
            .await
            .context("连接平台失败")?,
    );
    let uploader = DatasetUploader::new(
        connection,
        UploadOptions::from_config(&config.upload),
        &config.upload.service_root,
    )?;

    let key = DestinationKey::new(cli.dataset.as_str(), cli.component.as_str());
    if let Err(e) = uploader.send(&cli.file, &key, cli.md5.clone()).await {
        error!("上传失败: {}", e);
        return Err(e.into());
    }

    info!("上传成功: {:?} -> {}", cli.file, key);
    Ok(())
}
