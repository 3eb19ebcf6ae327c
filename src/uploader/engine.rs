// 上传传输引擎
//
// 为已建立会话的任务搬运字节，按 (传输方式, 存储类型) 选择策略：
// - 中转分片：分片 POST 到应用服务端
// - 直传分片（OneDrive）：分片带 Content-Range PUT 到存储后端
// - 直传整文件（COS / OSS / S3）：整个文件一次 PUT 到预签名 URL
//
// 分片策略严格按索引升序串行上传，已确认的分片直接跳过（断点续传）。
// 取消为协作式：每个分片前后检查任务状态，已发出的请求不会被中断。

use crate::remote::{ObjectUpload, ProgressFn, StorageTransport, UploadApi};
use crate::uploader::chunk::{chunk_range, UploadChunk};
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::events::{EventBus, UploadEvent};
use crate::uploader::queue::SharedTask;
use crate::uploader::task::{percent, StorageKind, TransferMethod, UploadTaskStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 传输策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    /// 分片经由应用服务端中转
    RelayChunked,
    /// 分片直传存储后端
    DirectChunked,
    /// 整文件直传预签名 URL
    DirectSingleShot,
}

impl TransferStrategy {
    /// 根据会话声明的传输方式与存储类型选择策略
    pub fn select(
        method: Option<TransferMethod>,
        kind: Option<StorageKind>,
    ) -> UploadResult<Self> {
        match (method, kind) {
            (None, _) => Err(UploadError::InvalidState("上传会话尚未建立".to_string())),
            (Some(TransferMethod::ServerRelay), _) => Ok(TransferStrategy::RelayChunked),
            (Some(TransferMethod::ClientDirect), Some(StorageKind::Onedrive)) => {
                Ok(TransferStrategy::DirectChunked)
            }
            (Some(TransferMethod::ClientDirect), Some(_)) => Ok(TransferStrategy::DirectSingleShot),
            (Some(TransferMethod::ClientDirect), None) => {
                Err(UploadError::Session("直传会话缺少存储类型".to_string()))
            }
        }
    }

    /// 完成后是否需要调用 finalize 生成文件记录
    pub fn needs_finalize(&self) -> bool {
        matches!(self, TransferStrategy::DirectSingleShot)
    }
}

/// 传输结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// 所有字节已确认
    Completed,
    /// 任务被取消，提前停止
    Canceled,
}

/// 分片循环所需的会话参数（从任务中一次性读出）
struct ChunkPlan {
    task_id: String,
    source: Option<PathBuf>,
    size: u64,
    chunk_size: u64,
    total_chunks: usize,
    session_id: Option<String>,
    upload_url: Option<String>,
}

/// 传输引擎
pub struct TransferWorker {
    api: Arc<dyn UploadApi>,
    storage: Arc<dyn StorageTransport>,
    events: EventBus,
}

impl TransferWorker {
    pub fn new(api: Arc<dyn UploadApi>, storage: Arc<dyn StorageTransport>, events: EventBus) -> Self {
        Self {
            api,
            storage,
            events,
        }
    }

    /// 执行传输
    ///
    /// 失败时如果任务已被取消，视为正常停止
    pub async fn run(&self, task: &SharedTask) -> UploadResult<TransferOutcome> {
        let strategy = {
            let t = task.lock();
            TransferStrategy::select(t.method, t.storage_kind)?
        };

        let result = match strategy {
            TransferStrategy::RelayChunked | TransferStrategy::DirectChunked => {
                self.run_chunked(task, strategy).await
            }
            TransferStrategy::DirectSingleShot => self.run_single_shot(task).await,
        };

        match result {
            Err(e) if is_canceled(task) => {
                debug!("任务已取消，忽略传输错误: {}", e);
                Ok(TransferOutcome::Canceled)
            }
            other => other,
        }
    }

    async fn run_chunked(
        &self,
        task: &SharedTask,
        strategy: TransferStrategy,
    ) -> UploadResult<TransferOutcome> {
        let plan = {
            let mut t = task.lock();
            // 以已确认分片重新计算已上传字节数
            let confirmed: u64 = t
                .uploaded_chunks
                .iter()
                .map(|i| {
                    let r = chunk_range(i, t.chunk_size, t.size);
                    r.end - r.start
                })
                .sum();
            t.uploaded_size = confirmed.min(t.size);
            t.progress = percent(t.uploaded_size, t.size);

            ChunkPlan {
                task_id: t.id.clone(),
                source: t.source.as_ref().map(|s| s.path.clone()),
                size: t.size,
                chunk_size: t.chunk_size,
                total_chunks: t.total_chunks,
                session_id: t.session_id.clone(),
                upload_url: t.upload_url.clone(),
            }
        };

        info!(
            "开始分片上传: task={}, strategy={:?}, 分片数={}, 分片大小={}",
            plan.task_id, strategy, plan.total_chunks, plan.chunk_size
        );

        for index in 0..plan.total_chunks {
            if is_canceled(task) {
                info!("[分片#{}] 任务已取消，停止上传: task={}", index, plan.task_id);
                return Ok(TransferOutcome::Canceled);
            }

            if task.lock().uploaded_chunks.contains(index) {
                debug!("[分片#{}] 已确认，跳过", index);
                continue;
            }

            let chunk = UploadChunk::new(index, chunk_range(index, plan.chunk_size, plan.size));
            let source = plan.source.as_deref().ok_or_else(|| {
                UploadError::InvalidState("任务缺少本地源文件，请重新选择文件".to_string())
            })?;
            let data = chunk.read_data(source).await?;

            match strategy {
                TransferStrategy::RelayChunked => {
                    let session_id = plan.session_id.as_deref().ok_or_else(|| {
                        UploadError::Session("中转会话缺少 sessionId".to_string())
                    })?;
                    self.api.upload_chunk(session_id, index, data).await?;
                }
                _ => {
                    let url = plan.upload_url.as_deref().ok_or_else(|| {
                        UploadError::Session("直传会话缺少 uploadUrl".to_string())
                    })?;
                    self.storage
                        .put_range(url, data, chunk.range.clone(), plan.size)
                        .await?;
                }
            }

            let event = {
                let mut t = task.lock();
                t.record_chunk(index, chunk.size());
                UploadEvent::progress(&t)
            };
            self.events.publish(event);

            debug!(
                "[分片#{}] 上传完成: {}/{} bytes",
                index,
                chunk.range.end,
                plan.size
            );

            if is_canceled(task) {
                info!("[分片#{}] 任务已取消，停止上传: task={}", index, plan.task_id);
                return Ok(TransferOutcome::Canceled);
            }
        }

        let complete = task.lock().all_chunks_uploaded();
        if !complete {
            warn!("分片循环结束但仍有未确认分片: task={}", plan.task_id);
            return Err(UploadError::Transport("存在未确认的分片".to_string()));
        }

        info!("所有分片上传完成: task={}", plan.task_id);
        Ok(TransferOutcome::Completed)
    }

    async fn run_single_shot(&self, task: &SharedTask) -> UploadResult<TransferOutcome> {
        if is_canceled(task) {
            return Ok(TransferOutcome::Canceled);
        }

        let (upload, task_id) = {
            let t = task.lock();
            let source = t.source.as_ref().ok_or_else(|| {
                UploadError::InvalidState("任务缺少本地源文件，请重新选择文件".to_string())
            })?;
            let url = t
                .upload_url
                .clone()
                .ok_or_else(|| UploadError::Session("直传会话缺少 uploadUrl".to_string()))?;
            let kind = t
                .storage_kind
                .ok_or_else(|| UploadError::Session("直传会话缺少存储类型".to_string()))?;
            (
                ObjectUpload {
                    url,
                    source: source.path.clone(),
                    content_type: t.content_type.clone(),
                    kind,
                },
                t.id.clone(),
            )
        };

        info!(
            "开始整文件直传: task={}, kind={:?}",
            task_id, upload.kind
        );

        let progress_task = task.clone();
        let events = self.events.clone();
        let progress: ProgressFn = Arc::new(move |sent, total| {
            let event = {
                let mut t = progress_task.lock();
                t.record_bytes(sent, total);
                UploadEvent::progress(&t)
            };
            events.publish(event);
        });

        self.storage.put_object(upload, progress).await?;

        if is_canceled(task) {
            info!("整文件直传期间任务已取消: task={}", task_id);
            return Ok(TransferOutcome::Canceled);
        }

        let event = {
            let mut t = task.lock();
            t.uploaded_size = t.size;
            t.progress = 100;
            UploadEvent::progress(&t)
        };
        self.events.publish(event);

        info!("整文件直传完成: task={}", task_id);
        Ok(TransferOutcome::Completed)
    }
}

fn is_canceled(task: &SharedTask) -> bool {
    task.lock().status == UploadTaskStatus::Canceled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::{ApiCall, MockStorage, MockUploadApi, StorageCall};
    use crate::uploader::chunk::chunk_count;
    use crate::uploader::task::{FileSource, UploadTask};
    use parking_lot::Mutex;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const MB: u64 = 1024 * 1024;

    fn temp_file(size: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn relay_task(file: &NamedTempFile, size: u64, chunk_size: u64) -> SharedTask {
        let mut task = UploadTask::new(
            FileSource::new(file.path().to_path_buf(), "big.bin".to_string(), size),
            "big.bin".to_string(),
            "/docs".to_string(),
        );
        task.method = Some(TransferMethod::ServerRelay);
        task.session_id = Some("sess-1".to_string());
        task.chunk_size = chunk_size;
        task.total_chunks = chunk_count(size, chunk_size);
        task.mark_uploading();
        Arc::new(Mutex::new(task))
    }

    fn worker(api: Arc<MockUploadApi>, storage: Arc<MockStorage>) -> TransferWorker {
        TransferWorker::new(api, storage, EventBus::default())
    }

    #[test]
    fn test_strategy_selection() {
        use TransferStrategy::*;
        assert_eq!(
            TransferStrategy::select(Some(TransferMethod::ServerRelay), None).unwrap(),
            RelayChunked
        );
        assert_eq!(
            TransferStrategy::select(Some(TransferMethod::ClientDirect), Some(StorageKind::Onedrive))
                .unwrap(),
            DirectChunked
        );
        for kind in [StorageKind::TencentCos, StorageKind::AliyunOss, StorageKind::AwsS3] {
            let strategy =
                TransferStrategy::select(Some(TransferMethod::ClientDirect), Some(kind)).unwrap();
            assert_eq!(strategy, DirectSingleShot);
            assert!(strategy.needs_finalize());
        }
        assert!(TransferStrategy::select(None, None).is_err());
        assert!(TransferStrategy::select(Some(TransferMethod::ClientDirect), None).is_err());
        assert!(!DirectChunked.needs_finalize());
    }

    #[tokio::test]
    async fn test_relay_ten_mib_in_five_chunks() {
        let size = 10 * MB;
        let file = temp_file(size as usize);
        let api = Arc::new(MockUploadApi::new(2 * MB));
        let task = relay_task(&file, size, 2 * MB);

        let outcome = worker(api.clone(), Arc::new(MockStorage::new()))
            .run(&task)
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed);
        assert_eq!(api.chunk_indices(), vec![0, 1, 2, 3, 4]);
        assert!(api
            .calls()
            .iter()
            .all(|c| matches!(c, ApiCall::Chunk { session_id, len, .. } if session_id == "sess-1" && *len == (2 * MB) as usize)));

        let t = task.lock();
        assert_eq!(t.progress, 100);
        assert_eq!(t.uploaded_size, size);
        assert_eq!(t.uploaded_chunk_count(), 5);
    }

    #[tokio::test]
    async fn test_fully_uploaded_task_makes_no_calls() {
        let api = Arc::new(MockUploadApi::new(4));
        let mut task = UploadTask::detached("a.bin".into(), 16, "a.bin".into(), "/".into());
        task.method = Some(TransferMethod::ServerRelay);
        task.session_id = Some("sess".to_string());
        task.chunk_size = 4;
        task.total_chunks = 4;
        task.status = UploadTaskStatus::Resumable;
        for i in 0..4 {
            task.uploaded_chunks.insert(i);
        }
        let task = Arc::new(Mutex::new(task));

        let outcome = worker(api.clone(), Arc::new(MockStorage::new()))
            .run(&task)
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed);
        assert!(api.calls().is_empty());
        let t = task.lock();
        assert_eq!(t.status, UploadTaskStatus::Resumable);
        assert_eq!(t.uploaded_size, 16);
        assert_eq!(t.progress, 100);
    }

    #[tokio::test]
    async fn test_resume_skips_confirmed_chunks() {
        let file = temp_file(10);
        let api = Arc::new(MockUploadApi::new(3));
        let task = relay_task(&file, 10, 3);
        {
            let mut t = task.lock();
            t.uploaded_chunks.insert(0);
            t.uploaded_chunks.insert(1);
        }

        worker(api.clone(), Arc::new(MockStorage::new()))
            .run(&task)
            .await
            .unwrap();

        assert_eq!(api.chunk_indices(), vec![2, 3]);
        assert!(api
            .calls()
            .contains(&ApiCall::Chunk { session_id: "sess-1".to_string(), index: 3, len: 1 }));
        assert_eq!(task.lock().uploaded_size, 10);
    }

    #[tokio::test]
    async fn test_chunk_failure_propagates() {
        let file = temp_file(10);
        let api = Arc::new(MockUploadApi::new(2));
        api.fail_chunk_at(Some(2));
        let task = relay_task(&file, 10, 2);

        let err = worker(api.clone(), Arc::new(MockStorage::new()))
            .run(&task)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Transport(_)));
        assert_eq!(api.chunk_indices(), vec![0, 1, 2]);
        let t = task.lock();
        assert_eq!(t.uploaded_chunks.iter().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(t.uploaded_size, 4);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let file = temp_file(10);
        let api = Arc::new(MockUploadApi::new(2));
        let task = relay_task(&file, 10, 2);
        task.lock().mark_canceled();

        let outcome = worker(api.clone(), Arc::new(MockStorage::new()))
            .run(&task)
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Canceled);
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_stops_after_current_chunk() {
        let file = temp_file(10);
        let api = Arc::new(MockUploadApi::new(2).with_chunk_delay(Duration::from_millis(40)));
        let task = relay_task(&file, 10, 2);

        let w = worker(api.clone(), Arc::new(MockStorage::new()));
        let canceler = {
            let task = task.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                task.lock().mark_canceled();
            }
        };
        let (outcome, _) = tokio::join!(w.run(&task), canceler);

        assert_eq!(outcome.unwrap(), TransferOutcome::Canceled);
        assert!(api.chunk_indices().len() < 5);
        assert_eq!(task.lock().status, UploadTaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_failure_after_cancel_is_clean_stop() {
        let file = temp_file(10);
        let api = Arc::new(MockUploadApi::new(2).with_chunk_delay(Duration::from_millis(40)));
        api.fail_chunk_at(Some(0));
        let task = relay_task(&file, 10, 2);

        let w = worker(api.clone(), Arc::new(MockStorage::new()));
        let canceler = {
            let task = task.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                task.lock().mark_canceled();
            }
        };
        let (outcome, _) = tokio::join!(w.run(&task), canceler);

        assert_eq!(outcome.unwrap(), TransferOutcome::Canceled);
    }

    #[tokio::test]
    async fn test_onedrive_chunked_direct() {
        let file = temp_file(10);
        let storage = Arc::new(MockStorage::new());
        let api = Arc::new(MockUploadApi::new(4));
        let task = relay_task(&file, 10, 4);
        {
            let mut t = task.lock();
            t.method = Some(TransferMethod::ClientDirect);
            t.storage_kind = Some(StorageKind::Onedrive);
            t.session_id = None;
            t.upload_url = Some("https://graph.example/upload".to_string());
        }

        worker(api.clone(), storage.clone()).run(&task).await.unwrap();

        assert!(api.calls().is_empty());
        let ranges: Vec<_> = storage
            .calls()
            .into_iter()
            .map(|c| match c {
                StorageCall::PutRange { range, total, .. } => (range, total),
                other => panic!("unexpected call: {:?}", other),
            })
            .collect();
        assert_eq!(ranges, vec![(0..4, 10), (4..8, 10), (8..10, 10)]);
        assert_eq!(task.lock().progress, 100);
    }

    #[tokio::test]
    async fn test_single_shot_reports_progress() {
        let file = temp_file(1000);
        let storage = Arc::new(MockStorage::new());
        let api = Arc::new(MockUploadApi::new(4));
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let task = relay_task(&file, 1000, 1000);
        {
            let mut t = task.lock();
            t.method = Some(TransferMethod::ClientDirect);
            t.storage_kind = Some(StorageKind::AwsS3);
            t.session_id = None;
            t.upload_url = Some("https://s3.example/obj?X-Amz-Signature=1".to_string());
            t.content_type = Some("application/pdf".to_string());
        }

        let w = TransferWorker::new(api.clone(), storage.clone(), events);
        assert_eq!(w.run(&task).await.unwrap(), TransferOutcome::Completed);

        assert_eq!(
            storage.calls(),
            vec![StorageCall::PutObject {
                url: "https://s3.example/obj?X-Amz-Signature=1".to_string(),
                content_type: Some("application/pdf".to_string()),
                kind: StorageKind::AwsS3,
            }]
        );
        match rx.recv().await.unwrap() {
            UploadEvent::Progress { progress, .. } => assert_eq!(progress, 50),
            other => panic!("unexpected event: {:?}", other),
        }
        let t = task.lock();
        assert_eq!(t.progress, 100);
        assert_eq!(t.uploaded_size, 1000);
    }

    #[tokio::test]
    async fn test_cancel_during_single_shot_put() {
        let file = temp_file(100);
        let storage = Arc::new(MockStorage::new().with_put_delay(Duration::from_millis(60)));
        let api = Arc::new(MockUploadApi::new(4));
        let task = relay_task(&file, 100, 100);
        {
            let mut t = task.lock();
            t.method = Some(TransferMethod::ClientDirect);
            t.storage_kind = Some(StorageKind::TencentCos);
            t.session_id = None;
            t.upload_url = Some("https://cos.example/obj".to_string());
        }

        let w = worker(api.clone(), storage.clone());
        let canceler = {
            let task = task.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                task.lock().mark_canceled();
            }
        };
        let (outcome, _) = tokio::join!(w.run(&task), canceler);

        assert_eq!(outcome.unwrap(), TransferOutcome::Canceled);
        assert_eq!(storage.calls().len(), 1);
        assert_eq!(task.lock().status, UploadTaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_empty_file_single_chunk() {
        let file = temp_file(0);
        let api = Arc::new(MockUploadApi::new(2 * MB));
        let task = relay_task(&file, 0, 2 * MB);

        worker(api.clone(), Arc::new(MockStorage::new()))
            .run(&task)
            .await
            .unwrap();

        assert_eq!(api.chunk_indices(), vec![0]);
        assert!(task.lock().all_chunks_uploaded());
    }
}
