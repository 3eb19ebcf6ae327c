// Drive Uploader Library
// 网盘分片上传引擎核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 远端 API 与对象存储传输模块
pub mod remote;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use remote::{HttpStorageTransport, HttpUploadApi, StorageTransport, UploadApi};
pub use uploader::{
    ConflictResolution, FolderScanner, UploadError, UploadEvent, UploadItem, UploadManager,
    UploadResult, UploadTask, UploadTaskStatus,
};
