// 存储后端直传
//
// - OneDrive：按分片 PUT 到上传会话 URL，携带 Content-Range
// - COS / OSS / S3：整个文件一次 PUT 到预签名 URL，通过流式 Body 回调进度

use crate::config::RemoteConfig;
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::task::StorageKind;
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::Client;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// 字节级进度回调 (已发送, 总大小)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 整文件直传参数
#[derive(Debug, Clone)]
pub struct ObjectUpload {
    /// 预签名 URL
    pub url: String,
    /// 本地源文件
    pub source: PathBuf,
    /// 服务端协商的 Content-Type
    pub content_type: Option<String>,
    pub kind: StorageKind,
}

/// `Content-Range` 头的值
pub fn content_range(range: &Range<u64>, total_size: u64) -> String {
    if range.is_empty() {
        format!("bytes */{}", total_size)
    } else {
        format!("bytes {}-{}/{}", range.start, range.end - 1, total_size)
    }
}

/// 存储后端传输
#[async_trait]
pub trait StorageTransport: Send + Sync {
    /// 按字节范围上传一个分片
    async fn put_range(
        &self,
        url: &str,
        data: Vec<u8>,
        range: Range<u64>,
        total_size: u64,
    ) -> UploadResult<()>;

    /// 一次性上传整个文件
    async fn put_object(&self, upload: ObjectUpload, progress: ProgressFn) -> UploadResult<()>;
}

/// 基于 HTTP 的实现
#[derive(Debug, Clone)]
pub struct HttpStorageTransport {
    client: Client,
}

impl HttpStorageTransport {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.transfer_timeout_secs))
            .build()
            .context("Failed to create storage HTTP client")?;
        Ok(Self { client })
    }

    async fn check(response: reqwest::Response, step: &str) -> UploadResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(UploadError::Transport(format!(
            "{}失败: HTTP {} {}",
            step,
            status.as_u16(),
            body
        )))
    }
}

#[async_trait]
impl StorageTransport for HttpStorageTransport {
    async fn put_range(
        &self,
        url: &str,
        data: Vec<u8>,
        range: Range<u64>,
        total_size: u64,
    ) -> UploadResult<()> {
        let header = content_range(&range, total_size);
        debug!("直传分片: {}", header);

        let response = self
            .client
            .put(url)
            .header(CONTENT_RANGE, header)
            .header(CONTENT_LENGTH, data.len())
            .body(data)
            .send()
            .await?;

        Self::check(response, "直传分片").await
    }

    async fn put_object(&self, upload: ObjectUpload, progress: ProgressFn) -> UploadResult<()> {
        let file = tokio::fs::File::open(&upload.source).await?;
        let total = file.metadata().await?.len();

        info!(
            "直传整文件: kind={:?}, size={}, source={:?}",
            upload.kind, total, upload.source
        );

        let mut sent = 0u64;
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                progress(sent, total);
            }
            chunk
        });

        let mut builder = self
            .client
            .put(&upload.url)
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(stream));

        // OSS / S3 的签名包含 Content-Type，必须与协商值一致
        if upload.kind.signs_content_type() {
            if let Some(content_type) = &upload.content_type {
                builder = builder.header(CONTENT_TYPE, content_type);
            }
        }

        let response = builder.send().await?;
        Self::check(response, "直传文件").await
    }
}
