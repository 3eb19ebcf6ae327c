// 测试用的内存远端实现：记录所有调用，并统计并发情况

use crate::remote::client::UploadApi;
use crate::remote::storage::{ObjectUpload, ProgressFn, StorageTransport};
use crate::remote::types::{
    CreateSessionRequest, FinalizedFile, SessionValidation, UploadSessionResponse,
};
use crate::uploader::chunk::chunk_count;
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::task::{parent_of, StorageKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ApiCall {
    Create { uri: String, overwrite: bool },
    Chunk { session_id: String, index: usize, len: usize },
    Delete { session_id: String, uri: String },
    Validate { session_id: String },
    Finalize { uri: String, policy_id: Option<String>, size: u64 },
}

#[derive(Default)]
pub(crate) struct MockUploadApi {
    chunk_size: u64,
    create_delay: Duration,
    chunk_delay: Duration,
    direct: Option<UploadSessionResponse>,
    existing: Mutex<HashSet<String>>,
    fail_chunk: Mutex<Option<usize>>,
    validations: Mutex<HashMap<String, SessionValidation>>,
    calls: Mutex<Vec<ApiCall>>,
    creating_dirs: Mutex<HashMap<String, usize>>,
    same_dir_overlap: AtomicBool,
    creates_in_flight: AtomicUsize,
    max_creates_in_flight: AtomicUsize,
    chunks_in_flight: AtomicUsize,
    max_chunks_in_flight: AtomicUsize,
}

impl MockUploadApi {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// 所有会话均返回该直传响应
    pub fn with_direct(mut self, response: UploadSessionResponse) -> Self {
        self.direct = Some(response);
        self
    }

    /// 标记远端已存在的路径（非覆盖创建时冲突）
    pub fn with_existing(self, uri: &str) -> Self {
        self.existing.lock().insert(uri.to_string());
        self
    }

    pub fn with_validation(self, session_id: &str, validation: SessionValidation) -> Self {
        self.validations
            .lock()
            .insert(session_id.to_string(), validation);
        self
    }

    pub fn fail_chunk_at(&self, index: Option<usize>) {
        *self.fail_chunk.lock() = index;
    }

    pub fn session_id_for(uri: &str) -> String {
        format!("sess:{}", uri)
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().clone()
    }

    pub fn chunk_indices(&self) -> Vec<usize> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ApiCall::Chunk { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&ApiCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn same_dir_overlap(&self) -> bool {
        self.same_dir_overlap.load(Ordering::SeqCst)
    }

    pub fn max_parallel_creates(&self) -> usize {
        self.max_creates_in_flight.load(Ordering::SeqCst)
    }

    pub fn max_parallel_chunks(&self) -> usize {
        self.max_chunks_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().push(call);
    }
}

fn enter(current: &AtomicUsize, max: &AtomicUsize) {
    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
    max.fetch_max(now, Ordering::SeqCst);
}

#[async_trait]
impl UploadApi for MockUploadApi {
    async fn create_session(
        &self,
        req: &CreateSessionRequest,
    ) -> UploadResult<UploadSessionResponse> {
        self.record(ApiCall::Create {
            uri: req.uri.clone(),
            overwrite: req.overwrite,
        });

        let dir = parent_of(&req.uri);
        {
            let mut dirs = self.creating_dirs.lock();
            let active = dirs.entry(dir.clone()).or_insert(0);
            *active += 1;
            if *active > 1 {
                self.same_dir_overlap.store(true, Ordering::SeqCst);
            }
        }
        enter(&self.creates_in_flight, &self.max_creates_in_flight);

        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        self.creates_in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(active) = self.creating_dirs.lock().get_mut(&dir) {
            *active -= 1;
        }

        if !req.overwrite && self.existing.lock().contains(&req.uri) {
            return Err(UploadError::Conflict(req.uri.clone()));
        }

        if let Some(direct) = &self.direct {
            return Ok(direct.clone());
        }

        Ok(UploadSessionResponse {
            session_id: Some(Self::session_id_for(&req.uri)),
            chunk_size: Some(self.chunk_size),
            total_chunks: Some(chunk_count(req.size, self.chunk_size)),
            ..UploadSessionResponse::default()
        })
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: usize,
        data: Vec<u8>,
    ) -> UploadResult<()> {
        self.record(ApiCall::Chunk {
            session_id: session_id.to_string(),
            index,
            len: data.len(),
        });

        enter(&self.chunks_in_flight, &self.max_chunks_in_flight);
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
        self.chunks_in_flight.fetch_sub(1, Ordering::SeqCst);

        if *self.fail_chunk.lock() == Some(index) {
            return Err(UploadError::Transport(format!("分片 #{} 连接被重置", index)));
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &str, uri: &str) -> UploadResult<()> {
        self.record(ApiCall::Delete {
            session_id: session_id.to_string(),
            uri: uri.to_string(),
        });
        Ok(())
    }

    async fn validate_session(&self, session_id: &str) -> UploadResult<SessionValidation> {
        self.record(ApiCall::Validate {
            session_id: session_id.to_string(),
        });
        Ok(self
            .validations
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn finalize(
        &self,
        uri: &str,
        policy_id: Option<&str>,
        size: u64,
    ) -> UploadResult<FinalizedFile> {
        self.record(ApiCall::Finalize {
            uri: uri.to_string(),
            policy_id: policy_id.map(str::to_string),
            size,
        });
        Ok(FinalizedFile {
            file_id: format!("file:{}", uri),
            name: uri.rsplit('/').next().unwrap_or_default().to_string(),
            size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StorageCall {
    PutRange {
        url: String,
        range: Range<u64>,
        total: u64,
    },
    PutObject {
        url: String,
        content_type: Option<String>,
        kind: StorageKind,
    },
}

#[derive(Default)]
pub(crate) struct MockStorage {
    put_delay: Duration,
    calls: Mutex<Vec<StorageCall>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 整文件 PUT 在记录调用之后等待的时长
    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<StorageCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl StorageTransport for MockStorage {
    async fn put_range(
        &self,
        url: &str,
        _data: Vec<u8>,
        range: Range<u64>,
        total_size: u64,
    ) -> UploadResult<()> {
        self.calls.lock().push(StorageCall::PutRange {
            url: url.to_string(),
            range,
            total: total_size,
        });
        Ok(())
    }

    async fn put_object(&self, upload: ObjectUpload, progress: ProgressFn) -> UploadResult<()> {
        let total = tokio::fs::metadata(&upload.source).await?.len();
        self.calls.lock().push(StorageCall::PutObject {
            url: upload.url.clone(),
            content_type: upload.content_type.clone(),
            kind: upload.kind,
        });
        if !self.put_delay.is_zero() {
            tokio::time::sleep(self.put_delay).await;
        }
        progress(total / 2, total);
        progress(total, total);
        Ok(())
    }
}
