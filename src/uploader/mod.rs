// 上传引擎模块
//
// - 上传队列：纯内存任务集合
// - 会话协商：按父目录串行 + 全局限速
// - 传输引擎：中转分片 / 直传分片 / 直传整文件
// - 上传管理器：有界并发调度、冲突处理、重试、断点恢复

pub mod chunk;
pub mod engine;
pub mod error;
pub mod events;
pub mod folder;
pub mod manager;
pub mod queue;
pub mod session;
pub mod task;

pub use chunk::{UploadChunk, DEFAULT_UPLOAD_CHUNK_SIZE};
pub use engine::{TransferOutcome, TransferStrategy, TransferWorker};
pub use error::{UploadError, UploadResult};
pub use events::{EventBus, UploadEvent};
pub use folder::{FolderScanner, ScanOptions};
pub use manager::{
    ConflictResolution, ListingProvider, RefreshCallback, StaticListing, UploadManager,
};
pub use queue::{SharedTask, UploadQueue};
pub use session::{PathCreationLock, SessionOrchestrator, SessionRateLimiter};
pub use task::{
    FileSource, StorageKind, TaskSnapshot, TransferMethod, UploadItem, UploadTask,
    UploadTaskStatus,
};
