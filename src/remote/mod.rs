// 远端服务边界：上传会话接口与存储后端直传

pub mod client;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{HttpUploadApi, UploadApi};
pub use storage::{HttpStorageTransport, ObjectUpload, ProgressFn, StorageTransport};
pub use types::{
    CreateSessionRequest, FinalizedFile, RemoteFileRecord, SessionValidation, StoragePolicyInfo,
    UploadSessionResponse,
};
