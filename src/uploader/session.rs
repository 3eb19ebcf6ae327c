// 上传会话协商
//
// 同一父目录下的会话创建请求必须串行：服务端在目录不存在时会自动创建目录，
// 并发创建会导致重复建目录失败。不同目录之间可以并行。
//
// 所有会话创建请求另外受全局限速约束（默认每 20ms 最多一次）。

use crate::remote::types::{CreateSessionRequest, UploadSessionResponse};
use crate::remote::UploadApi;
use crate::uploader::chunk::chunk_count;
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::queue::SharedTask;
use crate::uploader::task::{StorageKind, TransferMethod, UploadTask, UploadTaskStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 路径创建锁：父目录 → 正在进行的协商
///
/// 等待者持有 watch::Receiver，持锁者的 Sender 被释放时唤醒所有等待者
#[derive(Debug, Default)]
pub struct PathCreationLock {
    inflight: Mutex<HashMap<String, watch::Receiver<()>>>,
}

/// 持锁凭证，释放时移除目录条目并唤醒等待者
pub struct PathGuard<'a> {
    lock: &'a PathCreationLock,
    key: String,
    _release: watch::Sender<()>,
}

impl PathCreationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取目录锁；目录正被占用时等待其完成后重新检查
    pub async fn acquire(&self, key: &str) -> PathGuard<'_> {
        loop {
            let mut pending = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(());
                        inflight.insert(key.to_string(), rx);
                        return PathGuard {
                            lock: self,
                            key: key.to_string(),
                            _release: tx,
                        };
                    }
                }
            };

            debug!("目录 {} 正在创建会话，等待", key);
            // Sender 释放后 changed() 返回 Err
            let _ = pending.changed().await;
        }
    }

    /// 目录当前是否被占用
    pub fn is_locked(&self, key: &str) -> bool {
        self.inflight.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.lock.inflight.lock().remove(&self.key);
    }
}

/// 全局会话创建限速
#[derive(Debug)]
pub struct SessionRateLimiter {
    interval: Duration,
    last_call: tokio::sync::Mutex<Option<Instant>>,
}

impl SessionRateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: tokio::sync::Mutex::new(None),
        }
    }

    /// 等待直到距离上一次调用至少间隔 `interval`
    pub async fn acquire(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(prev) = *last_call {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

/// 协商得到的会话参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub method: TransferMethod,
    pub chunk_size: u64,
    pub total_chunks: usize,
    pub session_id: Option<String>,
    pub upload_url: Option<String>,
    pub content_type: Option<String>,
    pub storage_kind: Option<StorageKind>,
    pub policy_id: Option<String>,
}

impl NegotiatedSession {
    /// 由服务端响应计算会话参数
    pub fn from_response(
        response: UploadSessionResponse,
        size: u64,
        default_chunk_size: u64,
    ) -> UploadResult<Self> {
        let chunk_size = response
            .chunk_size
            .filter(|&c| c > 0)
            .unwrap_or(default_chunk_size);
        let total_chunks = chunk_count(size, chunk_size);
        let method = response.method.unwrap_or(TransferMethod::ServerRelay);

        match method {
            TransferMethod::ClientDirect => {
                let upload_url = response
                    .upload_url
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| UploadError::Session("直传会话缺少 uploadUrl".to_string()))?;
                let policy = response
                    .storage_policy
                    .ok_or_else(|| UploadError::Session("直传会话缺少 storagePolicy".to_string()))?;

                Ok(Self {
                    method,
                    chunk_size,
                    total_chunks,
                    session_id: None,
                    upload_url: Some(upload_url),
                    content_type: response.content_type,
                    storage_kind: Some(policy.kind),
                    policy_id: policy.id,
                })
            }
            TransferMethod::ServerRelay => {
                let session_id = response
                    .session_id
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| UploadError::Session("中转会话缺少 sessionId".to_string()))?;

                Ok(Self {
                    method,
                    chunk_size,
                    total_chunks,
                    session_id: Some(session_id),
                    upload_url: None,
                    content_type: None,
                    storage_kind: None,
                    policy_id: None,
                })
            }
        }
    }

    /// 写入任务的会话绑定字段
    pub fn apply(self, task: &mut UploadTask) {
        task.method = Some(self.method);
        task.chunk_size = self.chunk_size;
        task.total_chunks = self.total_chunks;
        task.session_id = self.session_id;
        task.upload_url = self.upload_url;
        task.content_type = self.content_type;
        task.storage_kind = self.storage_kind;
        if self.policy_id.is_some() {
            task.policy_id = self.policy_id;
        }
    }
}

/// 会话协商器
pub struct SessionOrchestrator {
    api: Arc<dyn UploadApi>,
    path_locks: PathCreationLock,
    rate_limiter: SessionRateLimiter,
    default_chunk_size: u64,
}

impl SessionOrchestrator {
    pub fn new(api: Arc<dyn UploadApi>, rate_limit: Duration, default_chunk_size: u64) -> Self {
        Self {
            api,
            path_locks: PathCreationLock::new(),
            rate_limiter: SessionRateLimiter::new(rate_limit),
            default_chunk_size,
        }
    }

    pub fn path_locks(&self) -> &PathCreationLock {
        &self.path_locks
    }

    /// 为任务协商上传会话并写入任务
    pub async fn negotiate(&self, task: &SharedTask) -> UploadResult<()> {
        let (request, parent_dir, task_id) = {
            let t = task.lock();
            (
                CreateSessionRequest {
                    uri: t.logical_path(),
                    size: t.size,
                    policy_id: t.policy_id.clone(),
                    overwrite: t.overwrite,
                },
                t.parent_dir(),
                t.id.clone(),
            )
        };

        let _guard = self.path_locks.acquire(&parent_dir).await;

        if task.lock().status == UploadTaskStatus::Canceled {
            return Err(UploadError::Canceled);
        }

        self.rate_limiter.acquire().await;
        let response = self.api.create_session(&request).await?;
        let session = NegotiatedSession::from_response(response, request.size, self.default_chunk_size)?;

        info!(
            "上传会话已建立: task={}, uri={}, method={:?}, chunk_size={}, total_chunks={}",
            task_id, request.uri, session.method, session.chunk_size, session.total_chunks
        );

        // 取消检查与写入会话在同一次加锁内完成，remove_item 只会看到其中一种结果
        let relay_session = session.session_id.clone();
        let canceled = {
            let mut t = task.lock();
            let canceled = t.status == UploadTaskStatus::Canceled;
            if !canceled {
                session.apply(&mut t);
            }
            canceled
        };

        if canceled {
            info!("会话创建期间任务已取消: task={}, uri={}", task_id, request.uri);
            if let Some(session_id) = relay_session {
                if let Err(e) = self.api.delete_session(&session_id, &request.uri).await {
                    warn!("删除上传会话失败（忽略）: session={}, error={}", session_id, e);
                }
            }
            return Err(UploadError::Canceled);
        }

        Ok(())
    }
}
