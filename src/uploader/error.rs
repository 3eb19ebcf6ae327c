// 上传错误类型
//
// 冲突（Conflict）不是失败，而是需要用户决策的节点；
// 取消（Canceled）由用户触发，不作为错误展示。

use thiserror::Error;

/// 上传引擎统一错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 目标路径已被占用，需要用户选择覆盖或重命名
    #[error("目标文件已存在: {0}")]
    Conflict(String),

    /// 会话创建/校验失败或会话已过期
    #[error("上传会话错误: {0}")]
    Session(String),

    /// 分片或整文件传输失败（仅在用户显式重试时重试）
    #[error("传输失败: {0}")]
    Transport(String),

    /// 用户取消
    #[error("上传已取消")]
    Canceled,

    /// 读取本地文件失败
    #[error("读取本地文件失败: {0}")]
    Io(#[from] std::io::Error),

    /// 任务当前状态不允许该操作
    #[error("任务状态不允许该操作: {0}")]
    InvalidState(String),

    /// 任务不存在
    #[error("任务不存在: {0}")]
    NotFound(String),

    /// 重新选择的文件与原任务不一致（名称+大小指纹）
    #[error("文件不匹配: 期望 {expected}，实际 {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

impl UploadError {
    /// 是否为冲突错误（决定任务进入 conflict 还是 error）
    pub fn is_conflict(&self) -> bool {
        matches!(self, UploadError::Conflict(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, UploadError::Canceled)
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Transport(err.to_string())
    }
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
