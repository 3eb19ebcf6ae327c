// 上传会话接口客户端
//
// 对应的服务端接口：
// - PUT    {base}/file/upload                       创建/校验上传会话
// - POST   {base}/file/upload/{session_id}/{index}  中转上传分片
// - DELETE {base}/file/upload                       删除上传会话
// - GET    {base}/file/upload/{session_id}          校验会话（断点恢复）
// - POST   {base}/file/upload/finalize              直传完成后生成文件记录

use crate::config::RemoteConfig;
use crate::remote::types::{
    ApiEnvelope, CreateSessionRequest, FinalizedFile, SessionValidation, UploadSessionResponse,
    CODE_OBJECT_EXISTED, CODE_SUCCESS,
};
use crate::uploader::error::{UploadError, UploadResult};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 上传会话相关的远端操作
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// 创建/校验上传会话；目标已存在时返回 `UploadError::Conflict`
    async fn create_session(&self, req: &CreateSessionRequest)
        -> UploadResult<UploadSessionResponse>;

    /// 中转上传一个分片
    async fn upload_chunk(&self, session_id: &str, index: usize, data: Vec<u8>)
        -> UploadResult<()>;

    /// 删除上传会话
    async fn delete_session(&self, session_id: &str, uri: &str) -> UploadResult<()>;

    /// 校验会话是否仍然有效
    async fn validate_session(&self, session_id: &str) -> UploadResult<SessionValidation>;

    /// 直传完成后生成文件记录
    async fn finalize(
        &self,
        uri: &str,
        policy_id: Option<&str>,
        size: u64,
    ) -> UploadResult<FinalizedFile>;
}

/// 基于 HTTP 的实现
#[derive(Debug, Clone)]
pub struct HttpUploadApi {
    client: Client,
    base_url: String,
    token: Option<String>,
    transfer_timeout: Duration,
}

impl HttpUploadApi {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        info!("初始化上传接口客户端: base_url={}", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            transfer_timeout: Duration::from_secs(config.transfer_timeout_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// 发送请求并读取响应状态与正文
    async fn send(&self, builder: RequestBuilder, step: &str) -> UploadResult<(StatusCode, String)> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| UploadError::Transport(format!("{}请求失败: {}", step, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UploadError::Transport(format!("读取{}响应失败: {}", step, e)))?;

        debug!("{}响应: status={}, body={}", step, status, text);
        Ok((status, text))
    }
}

/// 解析统一响应包装
///
/// `wrap` 决定非成功响应映射成哪类错误
fn parse_envelope<T: DeserializeOwned>(
    status: StatusCode,
    text: &str,
    step: &str,
    wrap: fn(String) -> UploadError,
) -> UploadResult<ApiEnvelope<T>> {
    if !status.is_success() {
        return Err(wrap(format!("{}失败: HTTP {} {}", step, status.as_u16(), text)));
    }

    let envelope: ApiEnvelope<T> = serde_json::from_str(text)
        .map_err(|e| wrap(format!("解析{}响应失败: {}, body={}", step, e, text)))?;

    if envelope.code != CODE_SUCCESS {
        return Err(wrap(format!(
            "{}失败: code={}, msg={}",
            step, envelope.code, envelope.msg
        )));
    }

    Ok(envelope)
}

/// 创建会话的响应分类：409 或 40004 视为冲突
fn classify_create_response(
    status: StatusCode,
    text: &str,
    uri: &str,
) -> UploadResult<UploadSessionResponse> {
    if status == StatusCode::CONFLICT {
        return Err(UploadError::Conflict(uri.to_string()));
    }

    if status.is_success() {
        if let Ok(envelope) = serde_json::from_str::<ApiEnvelope<Value>>(text) {
            if envelope.code == CODE_OBJECT_EXISTED {
                return Err(UploadError::Conflict(uri.to_string()));
            }
        }
    }

    parse_envelope::<UploadSessionResponse>(status, text, "创建上传会话", UploadError::Session)?
        .data
        .ok_or_else(|| UploadError::Session("创建上传会话响应缺少 data".to_string()))
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn create_session(
        &self,
        req: &CreateSessionRequest,
    ) -> UploadResult<UploadSessionResponse> {
        info!(
            "创建上传会话: uri={}, size={}, overwrite={}",
            req.uri, req.size, req.overwrite
        );

        let builder = self.client.put(self.url("file/upload")).json(req);
        let (status, text) = self.send(builder, "创建上传会话").await?;
        classify_create_response(status, &text, &req.uri)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: usize,
        data: Vec<u8>,
    ) -> UploadResult<()> {
        let url = self.url(&format!(
            "file/upload/{}/{}",
            urlencoding::encode(session_id),
            index
        ));

        let builder = self
            .client
            .post(url)
            .timeout(self.transfer_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data);

        let (status, text) = self.send(builder, "上传分片").await?;
        parse_envelope::<Value>(status, &text, "上传分片", UploadError::Transport)?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str, uri: &str) -> UploadResult<()> {
        let builder = self
            .client
            .delete(self.url("file/upload"))
            .json(&json!({ "id": session_id, "uri": uri }));

        let (status, text) = self.send(builder, "删除上传会话").await?;
        parse_envelope::<Value>(status, &text, "删除上传会话", UploadError::Session)?;
        info!("已删除上传会话: session={}, uri={}", session_id, uri);
        Ok(())
    }

    async fn validate_session(&self, session_id: &str) -> UploadResult<SessionValidation> {
        let url = self.url(&format!("file/upload/{}", urlencoding::encode(session_id)));
        let builder = self.client.get(url);

        let (status, text) = self.send(builder, "校验上传会话").await?;
        let validation = parse_envelope::<SessionValidation>(
            status,
            &text,
            "校验上传会话",
            UploadError::Session,
        )?
        .data
        .unwrap_or_default();

        if !validation.is_valid {
            warn!("上传会话已失效: session={}", session_id);
        }
        Ok(validation)
    }

    async fn finalize(
        &self,
        uri: &str,
        policy_id: Option<&str>,
        size: u64,
    ) -> UploadResult<FinalizedFile> {
        let builder = self
            .client
            .post(self.url("file/upload/finalize"))
            .json(&json!({ "uri": uri, "policyId": policy_id, "size": size }));

        let (status, text) = self.send(builder, "完成直传").await?;
        let file = parse_envelope::<FinalizedFile>(status, &text, "完成直传", UploadError::Session)?
            .data
            .ok_or_else(|| UploadError::Session("完成直传响应缺少 data".to_string()))?;

        info!("直传文件记录已生成: uri={}, file_id={}", uri, file.file_id);
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_conflict_status() {
        let err = classify_create_response(StatusCode::CONFLICT, "", "/docs/a.txt").unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_envelope_object_existed_is_conflict() {
        let body = r#"{"code":40004,"msg":"Object existed","data":null}"#;
        let err = classify_create_response(StatusCode::OK, body, "/docs/a.txt").unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_other_failures_are_session_errors() {
        let err =
            classify_create_response(StatusCode::INTERNAL_SERVER_ERROR, "oops", "/a").unwrap_err();
        assert!(matches!(err, UploadError::Session(_)));

        let body = r#"{"code":40001,"msg":"bad policy"}"#;
        let err = classify_create_response(StatusCode::OK, body, "/a").unwrap_err();
        assert!(matches!(err, UploadError::Session(ref m) if m.contains("bad policy")));

        let body = r#"{"code":0,"msg":""}"#;
        let err = classify_create_response(StatusCode::OK, body, "/a").unwrap_err();
        assert!(matches!(err, UploadError::Session(_)));
    }

    #[test]
    fn test_successful_session() {
        let body = r#"{"code":0,"data":{"sessionId":"abc","chunkSize":4,"totalChunks":3}}"#;
        let session = classify_create_response(StatusCode::OK, body, "/a").unwrap();
        assert_eq!(session.session_id.as_deref(), Some("abc"));
        assert_eq!(session.total_chunks, Some(3));
    }

    #[test]
    fn test_chunk_failure_is_transport_error() {
        let body = r#"{"code":500,"msg":"disk full"}"#;
        let err = parse_envelope::<Value>(StatusCode::OK, body, "上传分片", UploadError::Transport)
            .unwrap_err();
        assert!(matches!(err, UploadError::Transport(_)));
    }

    #[test]
    fn test_url_join() {
        let api = HttpUploadApi::new(&RemoteConfig {
            base_url: "http://drive.local/api/v4/".to_string(),
            ..RemoteConfig::default()
        })
        .unwrap();
        assert_eq!(api.url("/file/upload"), "http://drive.local/api/v4/file/upload");
    }
}
