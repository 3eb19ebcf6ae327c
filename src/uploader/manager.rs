// 上传管理器
//
// 界面层唯一交互的组件，负责：
// - 入队（忽略列表、去重、冲突预判）
// - 有界并发调度（JoinSet + Notify 唤醒）
// - 单任务流水线：延迟 → uploading → 会话协商 → 传输 → finalize → success
// - 速度采样（有任务上传时惰性启动）
// - 冲突处理、重试、断点恢复
//
// 任务状态迁移只在本模块发生；传输期间的进度字段由 TransferWorker 更新。

use crate::config::{clamp_concurrency, AppConfig, UploadConfig};
use crate::remote::types::RemoteFileRecord;
use crate::remote::{HttpStorageTransport, HttpUploadApi, StorageTransport, UploadApi};
use crate::uploader::chunk::chunk_count;
use crate::uploader::engine::{TransferOutcome, TransferStrategy, TransferWorker};
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::events::{EventBus, UploadEvent};
use crate::uploader::queue::{SharedTask, UploadQueue};
use crate::uploader::session::SessionOrchestrator;
use crate::uploader::task::{
    fingerprint, join_logical, percent, FileSource, TaskSnapshot, TransferMethod,
    UploadItem, UploadTask, UploadTaskStatus,
};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// 当前目录列表快照（由文件浏览器提供）
pub trait ListingProvider: Send + Sync {
    /// 当前展示的目录（逻辑路径）
    fn current_dir(&self) -> String;

    /// 逻辑路径是否已被占用
    fn exists(&self, logical_path: &str) -> bool;
}

/// 固定内容的目录列表
#[derive(Debug, Clone, Default)]
pub struct StaticListing {
    current_dir: String,
    existing: HashSet<String>,
}

impl StaticListing {
    pub fn new(current_dir: &str) -> Self {
        Self {
            current_dir: join_logical(current_dir, ""),
            existing: HashSet::new(),
        }
    }

    pub fn with_path(mut self, logical_path: &str) -> Self {
        self.existing.insert(join_logical("", logical_path));
        self
    }

    /// 由远端文件记录构造
    pub fn from_records(current_dir: &str, records: &[RemoteFileRecord]) -> Self {
        records.iter().fold(Self::new(current_dir), |listing, r| {
            listing.with_path(&join_logical(&r.path, &r.name))
        })
    }
}

impl ListingProvider for StaticListing {
    fn current_dir(&self) -> String {
        self.current_dir.clone()
    }

    fn exists(&self, logical_path: &str) -> bool {
        self.existing.contains(&join_logical("", logical_path))
    }
}

/// 队列清空后刷新文件列表的回调
pub type RefreshCallback = Arc<dyn Fn() + Send + Sync>;

/// 冲突处理方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// 覆盖远端文件
    Overwrite,
    /// 使用新文件名
    Rename(String),
}

struct ManagerInner {
    config: UploadConfig,
    queue: UploadQueue,
    api: Arc<dyn UploadApi>,
    orchestrator: SessionOrchestrator,
    worker: TransferWorker,
    events: EventBus,
    listing: RwLock<Option<Arc<dyn ListingProvider>>>,
    on_refresh: RwLock<Option<RefreshCallback>>,
    /// 最大同时上传文件数（动态可调整）
    concurrency: AtomicUsize,
    scheduler_running: AtomicBool,
    sampler_running: AtomicBool,
    /// 新任务入队/并发数变化时唤醒调度器
    wake: Notify,
    /// 调度器退出时通知等待者
    idle: Notify,
}

/// 上传管理器
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<ManagerInner>,
}

impl UploadManager {
    /// 创建上传管理器
    pub fn new(
        config: UploadConfig,
        api: Arc<dyn UploadApi>,
        storage: Arc<dyn StorageTransport>,
    ) -> Self {
        let events = EventBus::default();
        let orchestrator = SessionOrchestrator::new(
            api.clone(),
            config.session_rate_limit(),
            config.default_chunk_size,
        );
        let worker = TransferWorker::new(api.clone(), storage, events.clone());
        let concurrency = clamp_concurrency(config.max_concurrent_tasks);

        info!("创建上传管理器: 最大并发任务数={}", concurrency);

        Self {
            inner: Arc::new(ManagerInner {
                config,
                queue: UploadQueue::new(),
                api,
                orchestrator,
                worker,
                events,
                listing: RwLock::new(None),
                on_refresh: RwLock::new(None),
                concurrency: AtomicUsize::new(concurrency),
                scheduler_running: AtomicBool::new(false),
                sampler_running: AtomicBool::new(false),
                wake: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// 使用 HTTP 远端创建上传管理器
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let api = Arc::new(HttpUploadApi::new(&config.remote)?);
        let storage = Arc::new(HttpStorageTransport::new(&config.remote)?);
        Ok(Self::new(config.upload.clone(), api, storage))
    }

    /// 设置目录列表提供者
    pub fn set_listing(&self, listing: Arc<dyn ListingProvider>) {
        *self.inner.listing.write() = Some(listing);
    }

    /// 设置刷新回调
    pub fn set_refresh_callback(&self, callback: RefreshCallback) {
        *self.inner.on_refresh.write() = Some(callback);
    }

    /// 订阅任务事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency.load(Ordering::SeqCst)
    }

    /// 动态调整最大并发数（限制在 1-10）
    pub fn set_concurrency(&self, n: usize) {
        let clamped = clamp_concurrency(n);
        let old = self.inner.concurrency.swap(clamped, Ordering::SeqCst);
        info!("调整最大并发任务数: {} -> {}", old, clamped);
        self.inner.wake.notify_one();
    }

    /// 批量入队
    ///
    /// 返回是否有新任务加入
    pub fn add_uploads(&self, target_dir: &str, items: Vec<UploadItem>) -> bool {
        let listing = self.inner.listing.read().clone();
        let current_dir = listing.as_ref().map(|l| l.current_dir());
        let mut added = 0usize;
        let mut pending = 0usize;

        for item in items {
            if self.inner.config.is_ignored(&item.source.name) {
                debug!("跳过忽略文件: {}", item.relative_path);
                continue;
            }

            if self.inner.queue.contains_path(target_dir, &item.relative_path) {
                debug!("任务已在队列中，跳过: {}/{}", target_dir, item.relative_path);
                continue;
            }

            let mut task = UploadTask::new(item.source, item.relative_path, target_dir.to_string());
            let logical_path = task.logical_path();

            if let Some(current) = &current_dir {
                task.needs_refresh = affects_listing(&task, current);
            }

            if listing.as_ref().is_some_and(|l| l.exists(&logical_path)) {
                info!("目标文件已存在，等待用户处理冲突: {}", logical_path);
                task.mark_conflict(UploadError::Conflict(logical_path.clone()).to_string());
            } else {
                pending += 1;
            }

            let created = UploadEvent::created(&task);
            self.inner.queue.add(task);
            self.inner.events.publish(created);
            added += 1;
        }

        info!("添加上传任务: 新增 {} 个，其中待上传 {} 个", added, pending);

        if pending > 0 {
            self.inner.start_scheduler();
        }
        added > 0
    }

    /// 移除任务：取消 → 尽力删除中转会话 → 移出队列
    pub async fn remove_item(&self, id: &str) -> UploadResult<()> {
        let task = self
            .inner
            .queue
            .find(id)
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;

        // 读取会话与标记取消在同一次加锁内完成，与会话协商的写入互斥
        let mut relay_session = None;
        self.inner.update_status(&task, |t| {
            if t.status == UploadTaskStatus::Success {
                return;
            }
            if let Some(session_id) = &t.session_id {
                relay_session = Some((session_id.clone(), t.logical_path()));
            }
            t.mark_canceled();
        });

        if let Some((session_id, uri)) = relay_session {
            if let Err(e) = self.inner.api.delete_session(&session_id, &uri).await {
                warn!("删除上传会话失败（忽略）: session={}, error={}", session_id, e);
            }
        }

        if self.inner.queue.remove(id) {
            self.inner.events.publish(UploadEvent::Removed {
                task_id: id.to_string(),
            });
        }
        info!("上传任务已移除: {}", id);
        Ok(())
    }

    /// 重试任务
    ///
    /// resumable 任务必须提供重新选择的源文件（按名称+大小校验）
    pub fn retry_item(&self, id: &str, reselected: Option<FileSource>) -> UploadResult<()> {
        let task = self
            .inner
            .queue
            .find(id)
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;

        let mut result = Ok(());
        self.inner.update_status(&task, |t| {
            result = prepare_retry(t, reselected);
        });
        result?;

        info!("重试上传任务: {}", id);
        self.inner.start_scheduler();
        Ok(())
    }

    /// 重试所有失败任务，返回重试数量
    pub fn retry_all_failed(&self) -> usize {
        let failed = self.inner.queue.with_status(UploadTaskStatus::Error);
        for task in &failed {
            self.inner.update_status(task, UploadTask::reset_for_retry);
        }

        if !failed.is_empty() {
            info!("重试所有失败任务: {} 个", failed.len());
            self.inner.start_scheduler();
        }
        failed.len()
    }

    /// 处理冲突
    pub fn resolve_conflict(&self, id: &str, resolution: ConflictResolution) -> UploadResult<()> {
        let task = self
            .inner
            .queue
            .find(id)
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;

        let (status, target_dir, relative_path) = {
            let t = task.lock();
            (t.status, t.target_dir.clone(), t.relative_path.clone())
        };
        if status != UploadTaskStatus::Conflict {
            return Err(UploadError::InvalidState(format!(
                "任务 {} 不处于冲突状态: {}",
                id,
                status.as_str()
            )));
        }

        match resolution {
            ConflictResolution::Overwrite => {
                info!("冲突处理: 覆盖 {}", join_logical(&target_dir, &relative_path));
                self.inner.update_status(&task, |t| {
                    t.reset_for_retry();
                    t.overwrite = true;
                });
            }
            ConflictResolution::Rename(new_name) => {
                let new_name = new_name.trim().to_string();
                if new_name.is_empty() || new_name.contains(['/', '\\']) {
                    return Err(UploadError::InvalidState(format!(
                        "无效的文件名: {:?}",
                        new_name
                    )));
                }

                let new_relative = rename_last_segment(&relative_path, &new_name);
                let new_path = join_logical(&target_dir, &new_relative);
                let listing = self.inner.listing.read().clone();
                if listing.as_ref().is_some_and(|l| l.exists(&new_path))
                    || self.inner.queue.contains_path(&target_dir, &new_relative)
                {
                    return Err(UploadError::Conflict(new_path));
                }

                info!("冲突处理: 重命名为 {}", new_path);
                self.inner.update_status(&task, |t| {
                    t.reset_for_retry();
                    t.relative_path = new_relative;
                    t.name = new_name;
                    t.overwrite = false;
                });
            }
        }

        self.inner.start_scheduler();
        Ok(())
    }

    /// 从远端文件记录恢复中断的中转会话
    pub async fn add_resumable_task(&self, record: &RemoteFileRecord) -> UploadResult<String> {
        let session_id = record
            .upload_session_id()
            .ok_or_else(|| UploadError::Session(format!("文件 {} 没有上传会话", record.name)))?
            .to_string();

        if self.inner.queue.contains_path(&record.path, &record.name) {
            return Err(UploadError::InvalidState(format!(
                "任务已在队列中: {}",
                join_logical(&record.path, &record.name)
            )));
        }

        let validation = self.inner.api.validate_session(&session_id).await?;
        if !validation.is_valid {
            return Err(UploadError::Session(format!("上传会话已过期: {}", session_id)));
        }

        let mut task = UploadTask::detached(
            record.name.clone(),
            record.size,
            record.name.clone(),
            record.path.clone(),
        );
        let chunk_size = if validation.chunk_size > 0 {
            validation.chunk_size
        } else {
            self.inner.config.default_chunk_size
        };
        task.method = Some(TransferMethod::ServerRelay);
        task.session_id = Some(session_id.clone());
        task.chunk_size = chunk_size;
        task.total_chunks = if validation.total_chunks > 0 {
            validation.total_chunks
        } else {
            chunk_count(record.size, chunk_size)
        };
        for index in validation.uploaded_chunks {
            if index < task.total_chunks {
                task.uploaded_chunks.insert(index);
            }
        }
        task.uploaded_size =
            (task.uploaded_chunks.len() as u64 * chunk_size).min(task.size);
        task.progress = percent(task.uploaded_size, task.size);
        task.status = UploadTaskStatus::Resumable;
        task.is_resuming = true;

        info!(
            "恢复上传任务: {} (session={}, 已确认分片 {}/{})",
            task.logical_path(),
            session_id,
            task.uploaded_chunk_count(),
            task.total_chunks
        );

        let id = task.id.clone();
        let created = UploadEvent::created(&task);
        self.inner.queue.add(task);
        self.inner.events.publish(created);
        Ok(id)
    }

    /// 队列中是否还有未结束的任务
    pub fn has_active_work(&self) -> bool {
        self.inner
            .queue
            .tasks()
            .iter()
            .any(|t| !t.lock().status.is_terminal())
    }

    /// 调度器是否在运行
    pub fn is_scheduling(&self) -> bool {
        self.inner.scheduler_running.load(Ordering::SeqCst)
    }

    /// 等待调度器处理完所有待上传任务
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.is_scheduling() {
                return;
            }
            notified.await;
        }
    }

    pub fn get_task(&self, id: &str) -> Option<TaskSnapshot> {
        self.inner.queue.find(id).map(|t| t.lock().snapshot())
    }

    /// 所有任务快照（保持入队顺序）
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.inner
            .queue
            .tasks()
            .iter()
            .map(|t| t.lock().snapshot())
            .collect()
    }

    /// 清除已完成/已取消的任务
    pub fn clear_finished(&self) -> usize {
        let removed = self.inner.queue.clear_finished();
        if removed > 0 {
            info!("清除已结束任务: {} 个", removed);
        }
        removed
    }
}

/// 任务是否影响当前展示的目录
fn affects_listing(task: &UploadTask, current_dir: &str) -> bool {
    let current = join_logical(current_dir, "");
    if task.parent_dir() == current {
        return true;
    }
    // 在当前目录下新建子文件夹
    join_logical(&task.target_dir, "") == current
        && task.relative_path.trim_matches(['/', '\\']).contains(['/', '\\'])
}

fn rename_last_segment(relative_path: &str, new_name: &str) -> String {
    match relative_path.trim_end_matches('/').rsplit_once('/') {
        Some((dir, _)) => format!("{}/{}", dir, new_name),
        None => new_name.to_string(),
    }
}

fn prepare_retry(task: &mut UploadTask, reselected: Option<FileSource>) -> UploadResult<()> {
    if !task.status.is_retriable() {
        return Err(UploadError::InvalidState(format!(
            "任务 {} 当前状态不可重试: {}",
            task.id,
            task.status.as_str()
        )));
    }

    if let Some(source) = &reselected {
        // 重命名只改变远端名称，指纹按原始源文件计算
        let expected = task
            .source
            .as_ref()
            .map(FileSource::fingerprint)
            .unwrap_or_else(|| fingerprint(&task.name, task.size));
        let actual = source.fingerprint();
        if expected != actual {
            return Err(UploadError::FingerprintMismatch { expected, actual });
        }
    }

    if task.status == UploadTaskStatus::Resumable {
        let source = reselected.ok_or_else(|| {
            UploadError::InvalidState("恢复上传需要重新选择原文件".to_string())
        })?;
        // 保留会话与已确认分片
        task.source = Some(source);
        task.error = None;
        task.status = UploadTaskStatus::Pending;
        return Ok(());
    }

    task.reset_for_retry();
    if reselected.is_some() {
        task.source = reselected;
    }
    Ok(())
}

impl ManagerInner {
    /// 修改任务并在状态变化时发布事件
    fn update_status(&self, task: &SharedTask, apply: impl FnOnce(&mut UploadTask)) {
        let event = {
            let mut t = task.lock();
            let old = t.status;
            apply(&mut t);
            (t.status != old).then(|| UploadEvent::status_changed(&t, old))
        };
        if let Some(event) = event {
            self.events.publish(event);
        }
    }

    /// 调度器空闲时启动
    fn start_scheduler(self: &Arc<Self>) {
        if self
            .scheduler_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(self.clone().run_scheduler());
        } else {
            self.wake.notify_one();
        }
    }

    async fn run_scheduler(self: Arc<Self>) {
        info!("上传调度器启动");
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            self.fill_slots(&mut in_flight);

            if in_flight.is_empty() {
                self.on_drained();
                self.scheduler_running.store(false, Ordering::SeqCst);

                // 退出前再次检查，避免与入队操作竞争
                if self.queue.find_first_pending().is_some()
                    && self
                        .scheduler_running
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    continue;
                }

                self.idle.notify_waiters();
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    if let Some(Err(e)) = joined {
                        error!("上传流水线异常退出: {}", e);
                    }
                }
                _ = self.wake.notified() => {}
            }
        }

        info!("上传调度器退出");
    }

    /// 从队首开始填满空闲槽位
    fn fill_slots(self: &Arc<Self>, in_flight: &mut JoinSet<()>) {
        while in_flight.len() < self.concurrency.load(Ordering::SeqCst) {
            let Some(task) = self.queue.find_first_pending() else {
                break;
            };

            let mut claimed = false;
            self.update_status(&task, |t| {
                if t.status == UploadTaskStatus::Pending {
                    t.mark_processing();
                    claimed = true;
                }
            });

            if claimed {
                in_flight.spawn(self.clone().run_pipeline(task));
            }
        }
    }

    async fn run_pipeline(self: Arc<Self>, task: SharedTask) {
        let result = self.execute(&task).await;
        self.finish(&task, result);
    }

    async fn execute(self: &Arc<Self>, task: &SharedTask) -> UploadResult<TransferOutcome> {
        tokio::time::sleep(self.config.pipeline_start_delay()).await;

        let mut canceled = false;
        let mut resuming = false;
        self.update_status(task, |t| {
            if t.status == UploadTaskStatus::Canceled {
                canceled = true;
            } else {
                t.mark_uploading();
                resuming = t.is_resuming;
            }
        });
        if canceled {
            return Ok(TransferOutcome::Canceled);
        }

        self.ensure_sampler();

        if !resuming {
            self.orchestrator.negotiate(task).await?;
        }

        let outcome = self.worker.run(task).await?;
        if outcome == TransferOutcome::Canceled {
            return Ok(outcome);
        }

        let (strategy, uri, policy_id, size) = {
            let t = task.lock();
            if t.status == UploadTaskStatus::Canceled {
                return Ok(TransferOutcome::Canceled);
            }
            (
                TransferStrategy::select(t.method, t.storage_kind)?,
                t.logical_path(),
                t.policy_id.clone(),
                t.size,
            )
        };
        if strategy.needs_finalize() {
            self.api.finalize(&uri, policy_id.as_deref(), size).await?;
        }

        Ok(TransferOutcome::Completed)
    }

    /// 根据流水线结果设置最终状态；取消的任务保持原状
    fn finish(&self, task: &SharedTask, result: UploadResult<TransferOutcome>) {
        let (id, path) = {
            let t = task.lock();
            (t.id.clone(), t.logical_path())
        };

        match result {
            Ok(TransferOutcome::Completed) => {
                self.update_status(task, |t| {
                    if t.status != UploadTaskStatus::Canceled {
                        t.mark_success();
                    }
                });
                info!("上传完成: task={}, path={}", id, path);
            }
            Ok(TransferOutcome::Canceled) => {
                info!("上传已取消: task={}, path={}", id, path);
            }
            Err(e) if e.is_canceled() => {
                info!("上传已取消: task={}, path={}", id, path);
            }
            Err(e) => {
                let conflict = e.is_conflict();
                self.update_status(task, |t| {
                    if t.status == UploadTaskStatus::Canceled {
                        return;
                    }
                    if conflict {
                        t.mark_conflict(e.to_string());
                    } else {
                        t.mark_error(e.to_string());
                    }
                });
                if conflict {
                    warn!("上传冲突: task={}, path={}, {}", id, path, e);
                } else {
                    error!("上传失败: task={}, path={}, 错误: {}", id, path, e);
                }
            }
        }
    }

    /// 队列清空：按需触发刷新回调并发布汇总事件
    fn on_drained(&self) {
        let tasks = self.queue.tasks();
        let mut succeeded = 0;
        let mut failed = 0;
        let mut refresh_requested = false;

        for task in &tasks {
            let mut t = task.lock();
            match t.status {
                UploadTaskStatus::Success => {
                    succeeded += 1;
                    if t.needs_refresh {
                        refresh_requested = true;
                        t.needs_refresh = false;
                    }
                }
                UploadTaskStatus::Error | UploadTaskStatus::Conflict => failed += 1,
                _ => {}
            }
        }

        info!(
            "上传队列已清空: 成功 {} 个，失败/冲突 {} 个",
            succeeded, failed
        );

        if refresh_requested {
            let callback = self.on_refresh.read().clone();
            if let Some(callback) = callback {
                debug!("触发文件列表刷新");
                callback();
            }
        }

        self.events.publish(UploadEvent::Drained {
            succeeded,
            failed,
            refresh_requested,
        });
    }

    /// 有任务上传时启动速度采样器
    fn ensure_sampler(self: &Arc<Self>) {
        if self
            .sampler_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            debug!("速度采样器启动");
            let mut ticker = tokio::time::interval(inner.config.speed_sample_interval());
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let uploading = inner.queue.with_status(UploadTaskStatus::Uploading);
                if uploading.is_empty() {
                    inner.sampler_running.store(false, Ordering::SeqCst);
                    let resumed = !inner.queue.with_status(UploadTaskStatus::Uploading).is_empty()
                        && inner
                            .sampler_running
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok();
                    if !resumed {
                        break;
                    }
                    continue;
                }

                let now = Instant::now();
                for task in uploading {
                    let event = {
                        let mut t = task.lock();
                        t.sample_speed(now);
                        UploadEvent::progress(&t)
                    };
                    inner.events.publish(event);
                }
            }
            debug!("速度采样器停止");
        });
    }
}
