//! 上传事件
//!
//! 协调器通过 broadcast 通道推送任务变化，界面层订阅后无需轮询。
//! 订阅者处理过慢时会丢失旧事件（Lagged），发布方永不阻塞。

use crate::uploader::task::{UploadTask, UploadTaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// 默认通道容量
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// 上传任务事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务创建
    Created {
        task_id: String,
        name: String,
        logical_path: String,
        total_size: u64,
        status: UploadTaskStatus,
    },
    /// 状态变更
    StatusChanged {
        task_id: String,
        old_status: UploadTaskStatus,
        new_status: UploadTaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 进度更新
    Progress {
        task_id: String,
        uploaded_size: u64,
        total_size: u64,
        progress: u8,
        speed: u64,
        completed_chunks: usize,
        total_chunks: usize,
    },
    /// 任务已从队列移除
    Removed { task_id: String },
    /// 队列已无待处理任务
    Drained {
        succeeded: usize,
        failed: usize,
        refresh_requested: bool,
    },
}

impl UploadEvent {
    pub fn created(task: &UploadTask) -> Self {
        UploadEvent::Created {
            task_id: task.id.clone(),
            name: task.name.clone(),
            logical_path: task.logical_path(),
            total_size: task.size,
            status: task.status,
        }
    }

    pub fn progress(task: &UploadTask) -> Self {
        UploadEvent::Progress {
            task_id: task.id.clone(),
            uploaded_size: task.uploaded_size,
            total_size: task.size,
            progress: task.progress,
            speed: task.speed,
            completed_chunks: task.uploaded_chunk_count(),
            total_chunks: task.total_chunks,
        }
    }

    pub fn status_changed(task: &UploadTask, old_status: UploadTaskStatus) -> Self {
        UploadEvent::StatusChanged {
            task_id: task.id.clone(),
            old_status,
            new_status: task.status,
            error: task.error.clone(),
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            UploadEvent::Created { task_id, .. }
            | UploadEvent::StatusChanged { task_id, .. }
            | UploadEvent::Progress { task_id, .. }
            | UploadEvent::Removed { task_id } => Some(task_id),
            UploadEvent::Drained { .. } => None,
        }
    }
}

/// 事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }

    /// 发布事件；没有订阅者时直接丢弃
    pub fn publish(&self, event: UploadEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
