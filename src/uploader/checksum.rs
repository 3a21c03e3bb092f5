// 文件与分片 MD5 计算
//
// 服务端用 MD5（32 位十六进制小写）校验整个文件和每个分片

use crate::error::Result;
use md5::Context as Md5Context;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// 读取缓冲区大小
const BUFFER_SIZE: usize = 64 * 1024;

/// 计算内存数据的 MD5
pub fn md5_bytes(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// 计算文件的 MD5
///
/// 在阻塞线程池中执行文件 I/O
pub async fn md5_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || md5_file_sync(&path))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

fn md5_file_sync(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);

    let mut hasher = Md5Context::new();
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.consume(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    let digest = format!("{:x}", hasher.compute());
    debug!("文件 MD5 计算完成: path={:?}, size={}, md5={}", path, total, digest);
    Ok(digest)
}
