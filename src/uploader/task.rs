// 上传任务定义
//
// 状态机：
//   pending → processing → uploading → {success | error | conflict}
//   canceled 可由任意非终态进入；resumable 为从中断会话恢复的初始状态
//   error / conflict / resumable 可通过重试回到 pending

use bit_set::BitSet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 等待调度
    Pending,
    /// 已被调度器取出，等待开始
    Processing,
    /// 传输中
    Uploading,
    /// 已完成
    Success,
    /// 失败（可重试）
    Error,
    /// 目标路径冲突（等待用户决策）
    Conflict,
    /// 已取消
    Canceled,
    /// 从中断的中转会话恢复，等待用户重新选择文件
    Resumable,
}

impl UploadTaskStatus {
    /// 终态：不会再发生任何状态迁移
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadTaskStatus::Success | UploadTaskStatus::Canceled)
    }

    /// 是否允许通过重试回到 pending
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadTaskStatus::Error | UploadTaskStatus::Conflict | UploadTaskStatus::Resumable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadTaskStatus::Pending => "pending",
            UploadTaskStatus::Processing => "processing",
            UploadTaskStatus::Uploading => "uploading",
            UploadTaskStatus::Success => "success",
            UploadTaskStatus::Error => "error",
            UploadTaskStatus::Conflict => "conflict",
            UploadTaskStatus::Canceled => "canceled",
            UploadTaskStatus::Resumable => "resumable",
        }
    }
}

/// 传输方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransferMethod {
    /// 分片经由应用服务端中转
    ServerRelay,
    /// 客户端直传存储后端
    ClientDirect,
}

/// 直传存储后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Onedrive,
    TencentCos,
    AliyunOss,
    AwsS3,
}

impl StorageKind {
    /// 预签名 URL 的签名是否包含 Content-Type（上传时必须原样携带）
    pub fn signs_content_type(&self) -> bool {
        matches!(self, StorageKind::AliyunOss | StorageKind::AwsS3)
    }
}

/// 本地源文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    /// 本地路径
    pub path: PathBuf,
    /// 文件名
    pub name: String,
    /// 文件大小
    pub size: u64,
}

impl FileSource {
    pub fn new(path: PathBuf, name: String, size: u64) -> Self {
        Self { path, name, size }
    }

    /// 名称+大小指纹（恢复任务时校验用户重新选择的文件）
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.name, self.size)
    }
}

/// 待入队的单个文件（拖入文件夹时 relative_path 含子目录）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub source: FileSource,
    pub relative_path: String,
}

impl UploadItem {
    pub fn new(source: FileSource, relative_path: impl Into<String>) -> Self {
        Self {
            source,
            relative_path: relative_path.into(),
        }
    }

    /// 单个文件，相对路径即文件名
    pub fn single(source: FileSource) -> Self {
        let relative_path = source.name.clone();
        Self {
            source,
            relative_path,
        }
    }
}

pub(crate) fn fingerprint(name: &str, size: u64) -> String {
    format!("{}:{}", name, size)
}

/// 拼接逻辑路径，统一为以 `/` 开头、无重复分隔符的形式
pub fn join_logical(dir: &str, relative: &str) -> String {
    let segments: Vec<&str> = dir
        .split(['/', '\\'])
        .chain(relative.split(['/', '\\']))
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

/// 逻辑路径的父目录
pub fn parent_of(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

/// 计算百分比进度（四舍五入，上限 100）
pub fn percent(uploaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let value = (uploaded as f64 / total as f64 * 100.0).round();
    value.clamp(0.0, 100.0) as u8
}

/// 上传任务
#[derive(Debug, Clone)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 文件名
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// 源文件（恢复任务在用户重新选择文件前为 None）
    pub source: Option<FileSource>,
    /// 相对路径（拖入文件夹时包含子目录）
    pub relative_path: String,
    /// 目标目录（逻辑路径）
    pub target_dir: String,

    // === 会话绑定 ===
    pub method: Option<TransferMethod>,
    pub storage_kind: Option<StorageKind>,
    pub upload_url: Option<String>,
    pub content_type: Option<String>,
    pub policy_id: Option<String>,
    /// 中转会话ID（仅 server-relay）
    pub session_id: Option<String>,
    pub chunk_size: u64,
    pub total_chunks: usize,

    // === 进度 ===
    pub status: UploadTaskStatus,
    /// 百分比进度 0..=100
    pub progress: u8,
    /// 已上传字节数
    pub uploaded_size: u64,
    /// 已确认上传的分片索引
    pub uploaded_chunks: BitSet,
    /// 瞬时速度 (bytes/s)
    pub speed: u64,
    /// 平均速度 (bytes/s)
    pub avg_speed: u64,
    /// 开始上传时间 (Unix 毫秒)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix 毫秒)
    pub completed_at: Option<i64>,
    pub(crate) upload_started: Option<Instant>,
    pub(crate) last_sample_at: Option<Instant>,
    pub(crate) last_sample_bytes: u64,

    // === 冲突 / 恢复 ===
    pub overwrite: bool,
    pub needs_refresh: bool,
    pub error: Option<String>,
    pub is_resuming: bool,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(source: FileSource, relative_path: String, target_dir: String) -> Self {
        let mut task = Self::detached(source.name.clone(), source.size, relative_path, target_dir);
        task.source = Some(source);
        task
    }

    /// 创建没有本地源文件的任务（用于恢复）
    pub(crate) fn detached(
        name: String,
        size: u64,
        relative_path: String,
        target_dir: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            size,
            source: None,
            relative_path,
            target_dir,
            method: None,
            storage_kind: None,
            upload_url: None,
            content_type: None,
            policy_id: None,
            session_id: None,
            chunk_size: 0,
            total_chunks: 0,
            status: UploadTaskStatus::Pending,
            progress: 0,
            uploaded_size: 0,
            uploaded_chunks: BitSet::new(),
            speed: 0,
            avg_speed: 0,
            started_at: None,
            completed_at: None,
            upload_started: None,
            last_sample_at: None,
            last_sample_bytes: 0,
            overwrite: false,
            needs_refresh: false,
            error: None,
            is_resuming: false,
        }
    }

    /// 目标文件的完整逻辑路径
    pub fn logical_path(&self) -> String {
        join_logical(&self.target_dir, &self.relative_path)
    }

    /// 目标文件所在的逻辑父目录（路径创建锁的键）
    pub fn parent_dir(&self) -> String {
        parent_of(&self.logical_path())
    }

    /// 已确认分片数
    pub fn uploaded_chunk_count(&self) -> usize {
        self.uploaded_chunks.len()
    }

    /// 是否所有分片都已确认
    pub fn all_chunks_uploaded(&self) -> bool {
        self.total_chunks > 0 && self.uploaded_chunks.len() >= self.total_chunks
    }

    /// 记录分片完成并推进进度；重复或越界的索引被忽略
    pub fn record_chunk(&mut self, index: usize, len: u64) -> bool {
        if index >= self.total_chunks || !self.uploaded_chunks.insert(index) {
            return false;
        }
        self.uploaded_size = (self.uploaded_size + len).min(self.size);
        self.progress = percent(self.uploaded_size, self.size);
        true
    }

    /// 直传时按传输层回调更新进度
    pub fn record_bytes(&mut self, sent: u64, total: u64) {
        let total = if total == 0 { self.size } else { total };
        self.uploaded_size = sent.min(self.size);
        self.progress = percent(sent, total);
    }

    pub fn mark_processing(&mut self) {
        self.status = UploadTaskStatus::Processing;
    }

    pub fn mark_uploading(&mut self) {
        let now = Instant::now();
        self.status = UploadTaskStatus::Uploading;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp_millis());
        }
        self.upload_started = Some(now);
        self.last_sample_at = Some(now);
        self.last_sample_bytes = self.uploaded_size;
    }

    pub fn mark_success(&mut self) {
        self.status = UploadTaskStatus::Success;
        self.uploaded_size = self.size;
        self.progress = 100;
        self.speed = 0;
        self.error = None;
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn mark_error(&mut self, error: String) {
        self.status = UploadTaskStatus::Error;
        self.speed = 0;
        self.error = Some(error);
    }

    pub fn mark_conflict(&mut self, error: String) {
        self.status = UploadTaskStatus::Conflict;
        self.speed = 0;
        self.error = Some(error);
    }

    pub fn mark_canceled(&mut self) {
        self.status = UploadTaskStatus::Canceled;
        self.speed = 0;
    }

    /// 清空进度与会话字段并回到 pending
    pub fn reset_for_retry(&mut self) {
        self.method = None;
        self.storage_kind = None;
        self.upload_url = None;
        self.content_type = None;
        self.policy_id = None;
        self.session_id = None;
        self.chunk_size = 0;
        self.total_chunks = 0;
        self.progress = 0;
        self.uploaded_size = 0;
        self.uploaded_chunks.clear();
        self.speed = 0;
        self.avg_speed = 0;
        self.started_at = None;
        self.completed_at = None;
        self.upload_started = None;
        self.last_sample_at = None;
        self.last_sample_bytes = 0;
        self.error = None;
        self.is_resuming = false;
        self.status = UploadTaskStatus::Pending;
    }

    /// 采样速度：瞬时速度 = Δbytes/Δt，平均速度 = bytes/总耗时
    pub fn sample_speed(&mut self, now: Instant) {
        if let Some(last) = self.last_sample_at {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                let delta = self.uploaded_size.saturating_sub(self.last_sample_bytes);
                self.speed = (delta as f64 / elapsed) as u64;
            }
        }
        if let Some(started) = self.upload_started {
            let elapsed = now.saturating_duration_since(started).as_secs_f64();
            if elapsed > 0.0 {
                self.avg_speed = (self.uploaded_size as f64 / elapsed) as u64;
            }
        }
        self.last_sample_at = Some(now);
        self.last_sample_bytes = self.uploaded_size;
    }

    /// 生成供界面渲染的快照
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            relative_path: self.relative_path.clone(),
            target_dir: self.target_dir.clone(),
            logical_path: self.logical_path(),
            method: self.method,
            storage_kind: self.storage_kind,
            status: self.status,
            progress: self.progress,
            uploaded_size: self.uploaded_size,
            uploaded_chunks: self.uploaded_chunks.iter().collect(),
            total_chunks: self.total_chunks,
            speed: self.speed,
            avg_speed: self.avg_speed,
            started_at: self.started_at,
            completed_at: self.completed_at,
            overwrite: self.overwrite,
            error: self.error.clone(),
            is_resuming: self.is_resuming,
        }
    }
}

/// 上传任务快照（可序列化）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub relative_path: String,
    pub target_dir: String,
    pub logical_path: String,
    pub method: Option<TransferMethod>,
    pub storage_kind: Option<StorageKind>,
    pub status: UploadTaskStatus,
    pub progress: u8,
    pub uploaded_size: u64,
    pub uploaded_chunks: Vec<usize>,
    pub total_chunks: usize,
    pub speed: u64,
    pub avg_speed: u64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub overwrite: bool,
    pub error: Option<String>,
    pub is_resuming: bool,
}
