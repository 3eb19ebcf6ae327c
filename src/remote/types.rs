// 上传相关的远端接口数据类型

use crate::uploader::task::{StorageKind, TransferMethod};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 成功
pub const CODE_SUCCESS: i32 = 0;

/// 目标对象已存在
pub const CODE_OBJECT_EXISTED: i32 = 40004;

/// 远端文件元数据中保存中转会话ID的键
pub const SESSION_METADATA_KEY: &str = "upload_session_id";

/// 统一响应包装
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    /// 业务码（0 表示成功）
    pub code: i32,

    /// 错误信息
    #[serde(default)]
    pub msg: String,

    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

/// 创建/校验上传会话请求
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// 目标文件逻辑路径
    pub uri: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    pub overwrite: bool,
}

/// 直传存储策略信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoragePolicyInfo {
    #[serde(rename = "type")]
    pub kind: StorageKind,

    #[serde(default)]
    pub id: Option<String>,
}

/// 上传会话响应
///
/// server-relay: `{sessionId, chunkSize, totalChunks}`
/// client-direct: `{uploadUrl, contentType, storagePolicy:{type}, chunkSize, totalChunks}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionResponse {
    /// 未声明时视为 server-relay
    #[serde(default)]
    pub method: Option<TransferMethod>,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub chunk_size: Option<u64>,

    #[serde(default)]
    pub total_chunks: Option<usize>,

    #[serde(default)]
    pub upload_url: Option<String>,

    #[serde(default)]
    pub content_type: Option<String>,

    #[serde(default)]
    pub storage_policy: Option<StoragePolicyInfo>,
}

/// 会话校验结果
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionValidation {
    pub is_valid: bool,

    /// 服务端已确认的分片索引
    #[serde(default)]
    pub uploaded_chunks: Vec<usize>,

    #[serde(default)]
    pub total_chunks: usize,

    #[serde(default)]
    pub chunk_size: u64,
}

/// 直传完成后服务端生成的文件记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedFile {
    pub file_id: String,
    pub name: String,
    pub size: u64,
}

/// 远端文件记录（文件列表中的一项）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileRecord {
    pub name: String,

    /// 所在目录（逻辑路径）
    pub path: String,

    pub size: u64,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RemoteFileRecord {
    /// 元数据中保存的中转会话ID
    pub fn upload_session_id(&self) -> Option<&str> {
        self.metadata
            .get(SESSION_METADATA_KEY)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}
