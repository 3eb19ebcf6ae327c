// 上传分片划分
//
// 分片规则：
// - 分片大小由服务端会话下发，缺失时使用默认值
// - 分片数 = ceil(文件大小 / 分片大小)，空文件按一个空分片处理
// - 分片 i 的范围为 [i*chunk_size, min((i+1)*chunk_size, size))

use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 默认上传分片大小: 2MB（服务端未下发时使用）
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// 计算分片数量
pub fn chunk_count(total_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 1;
    }
    total_size.div_ceil(chunk_size).max(1) as usize
}

/// 计算指定分片的字节范围
pub fn chunk_range(index: usize, chunk_size: u64, total_size: u64) -> Range<u64> {
    let start = (index as u64).saturating_mul(chunk_size).min(total_size);
    let end = start.saturating_add(chunk_size).min(total_size);
    start..end
}

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 读取分片数据
    pub async fn read_data(&self, file_path: &Path) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(file_path).await?;

        file.seek(std::io::SeekFrom::Start(self.range.start)).await?;

        let mut buffer = vec![0u8; self.size() as usize];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.index,
            self.range.start,
            self.range.end,
            buffer.len()
        );

        Ok(buffer)
    }
}
