//! PVOutput 状态上传
//!
//! `POST {base_url}/service/r2/addstatus.jsp`，表单编码，凭据放在请求头中。
//!
//! | 响应 | 结果 | 处理 |
//! |---|---|---|
//! | 2xx | 成功 | - |
//! | 4xx | `Rejected` | 不重试（凭据或参数问题） |
//! | 5xx / 网络错误 / 超时 | `TransientFailure` | 指数退避重试，达到上限后放弃本次 |
//!
//! 关停信号会中断重试前的等待（`Cancelled`），不会中断已发出的请求。

use crate::payload::{build_payload, has_required_fields};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::Utc;
use domain::{AggregatedSnapshot, StatusPayload, UploadOutcome, UploadRecord};
use ems_telemetry::{
    record_upload_attempt, record_upload_rejected, record_upload_success, record_upload_transient,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const ADD_STATUS_PATH: &str = "/service/r2/addstatus.jsp";
const API_KEY_HEADER: &str = "X-Pvoutput-Apikey";
const SYSTEM_ID_HEADER: &str = "X-Pvoutput-SystemId";

/// 上传错误。
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// 4xx：凭据错误或请求格式错误，不可重试
    #[error("upload rejected with status {status}: {body}")]
    Rejected {
        status: u16,
        body: String,
        /// 含此前的瞬时失败尝试
        attempts: u32,
    },

    /// 5xx、网络错误或超时，已按策略重试
    #[error("upload failed after {attempts} attempt(s): {message}")]
    TransientFailure {
        status: Option<u16>,
        message: String,
        attempts: u32,
    },

    /// 关停时放弃重试等待
    #[error("upload cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    /// 快照缺少电量与功率，不上传
    #[error("snapshot has no energy or power values to upload")]
    EmptyPayload,

    /// HTTP 客户端构建失败
    #[error("http client error: {0}")]
    Client(String),
}

impl UploadError {
    pub fn outcome(&self) -> UploadOutcome {
        match self {
            Self::Rejected { .. } | Self::EmptyPayload => UploadOutcome::Rejected,
            Self::TransientFailure { .. } | Self::Cancelled { .. } | Self::Client(_) => {
                UploadOutcome::TransientFailure
            }
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::TransientFailure { status, .. } => *status,
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Rejected { attempts, .. }
            | Self::TransientFailure { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
            _ => 0,
        }
    }
}

/// 状态上传器抽象（调度器只依赖该接口）。
#[async_trait]
pub trait StatusUploader: Send + Sync {
    /// 该快照将被提交的字段（用于失败记录）。
    fn payload_for(&self, snapshot: &AggregatedSnapshot) -> StatusPayload;

    async fn upload(&self, snapshot: &AggregatedSnapshot) -> Result<UploadRecord, UploadError>;
}

/// PVOutput 连接参数
#[derive(Debug, Clone)]
pub struct PvoutputConfig {
    pub base_url: String,
    pub api_key: String,
    pub system_id: String,
    /// 单次请求超时
    pub timeout: Duration,
    /// 是否提交 v7~v9
    pub extended: bool,
    pub retry: RetryPolicy,
}

impl PvoutputConfig {
    pub fn new(api_key: impl Into<String>, system_id: impl Into<String>) -> Self {
        Self {
            base_url: "https://pvoutput.org".to_string(),
            api_key: api_key.into(),
            system_id: system_id.into(),
            timeout: Duration::from_secs(10),
            extended: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// 基于 reqwest 的 PVOutput 上传器。
pub struct PvoutputUploader {
    client: reqwest::Client,
    endpoint: String,
    config: PvoutputConfig,
    cancel: CancellationToken,
}

impl PvoutputUploader {
    pub fn new(config: PvoutputConfig) -> Result<Self, UploadError> {
        Self::with_cancellation(config, CancellationToken::new())
    }

    /// `cancel` 触发后，重试前的退避等待立即放弃。
    pub fn with_cancellation(
        config: PvoutputConfig,
        cancel: CancellationToken,
    ) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| UploadError::Client(err.to_string()))?;
        let endpoint = format!("{}{}", config.base_url.trim_end_matches('/'), ADD_STATUS_PATH);
        Ok(Self {
            client,
            endpoint,
            config,
            cancel,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send_once(
        &self,
        form: &[(&'static str, String)],
        attempt: u32,
    ) -> Result<u16, UploadError> {
        record_upload_attempt();
        let response = self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.config.api_key)
            .header(SYSTEM_ID_HEADER, &self.config.system_id)
            .form(form)
            .send()
            .await
            .map_err(|err| UploadError::TransientFailure {
                status: None,
                message: err.to_string(),
                attempts: attempt,
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(status.as_u16())
        } else if status.is_client_error() {
            Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
                attempts: attempt,
            })
        } else {
            Err(UploadError::TransientFailure {
                status: Some(status.as_u16()),
                message: body,
                attempts: attempt,
            })
        }
    }

    async fn send_with_retry(&self, form: &[(&'static str, String)]) -> Result<(u16, u32), UploadError> {
        let retry = self.config.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(form, attempt).await {
                Ok(status) => return Ok((status, attempt)),
                Err(err @ UploadError::TransientFailure { .. }) if retry.should_retry(attempt) => {
                    let delay = retry.delay_after(attempt);
                    warn!(
                        target: "ems.upload",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "upload_retry_scheduled"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            info!(target: "ems.upload", attempt, "upload_retry_cancelled");
                            return Err(UploadError::Cancelled { attempts: attempt });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl StatusUploader for PvoutputUploader {
    fn payload_for(&self, snapshot: &AggregatedSnapshot) -> StatusPayload {
        build_payload(snapshot, self.config.extended)
    }

    async fn upload(&self, snapshot: &AggregatedSnapshot) -> Result<UploadRecord, UploadError> {
        let scheduled_at = Utc::now();
        let payload = self.payload_for(snapshot);
        if !has_required_fields(&payload) {
            warn!(target: "ems.upload", "upload_skipped_empty_payload");
            return Err(UploadError::EmptyPayload);
        }

        let form = payload.to_form();
        match self.send_with_retry(&form).await {
            Ok((status, attempts)) => {
                record_upload_success();
                info!(
                    target: "ems.upload",
                    status,
                    attempts,
                    date = %payload.d,
                    time = %payload.t,
                    energy_wh = ?payload.v1,
                    power_w = ?payload.v2,
                    "upload_succeeded"
                );
                Ok(UploadRecord {
                    scheduled_at,
                    payload,
                    outcome: UploadOutcome::Success,
                    http_status: Some(status),
                    attempts,
                })
            }
            Err(err) => {
                match err.outcome() {
                    UploadOutcome::Rejected => record_upload_rejected(),
                    _ => record_upload_transient(),
                }
                warn!(
                    target: "ems.upload",
                    status = ?err.http_status(),
                    attempts = err.attempts(),
                    error = %err,
                    "upload_failed"
                );
                Err(err)
            }
        }
    }
}
