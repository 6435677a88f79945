//! 启动装配与连通性校验
//!
//! 配置 → 各能力模块参数的转换集中在这里；`validate_device` / `validate_upload`
//! 各执行一次真实操作并原样返回结果，由调用方决定是否终止启动。

use domain::{AggregatedSnapshot, DeviceProfile, ProfileCatalog, ProfileError, UploadRecord};
use ems_config::{AppConfig, ConfigError};
use ems_pipeline::PipelineError;
use ems_protocol::{
    BackoffConfig, ConnectionConfig, ConnectionError, ConnectionManager, ParameterStyle,
    ReadError, UnknownParameterStyle,
};
use ems_upload::{
    PvoutputConfig, RetryPolicy, SchedulerConfig, StatusUploader, UploadError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 启动期错误。
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("profile error: {0}")]
    Profile(#[from] ProfileError),
    #[error("invalid EMS_MODBUS_PARAMETER_STYLE: {0}")]
    ParameterStyle(#[from] UnknownParameterStyle),
    #[error("cannot connect to inverter: {0}")]
    Device(#[from] ConnectionError),
    #[error("cannot read inverter registers: {0}")]
    Read(#[from] ReadError),
    #[error("pvoutput upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error("aggregator unavailable: {0}")]
    Pipeline(#[from] PipelineError),
}

/// 加载并选取当前型号的设备画像。
pub fn load_profile(config: &AppConfig) -> Result<Arc<DeviceProfile>, ValidationError> {
    let catalog = ProfileCatalog::load(&config.profile_path)?;
    let profile = catalog.get(&config.inverter_model)?;
    info!(
        target: "ems.bridge",
        model = profile.model(),
        registers = profile.registers().len(),
        derived = profile.derived().len(),
        "profile_loaded"
    );
    Ok(profile)
}

pub fn connection_config(config: &AppConfig) -> Result<ConnectionConfig, ValidationError> {
    let pinned_style = config
        .modbus_parameter_style
        .as_deref()
        .map(str::parse::<ParameterStyle>)
        .transpose()?;
    Ok(ConnectionConfig {
        endpoint: config.modbus_endpoint(),
        unit_id: config.modbus_unit_id,
        connect_timeout: Duration::from_millis(config.modbus_connect_timeout_ms),
        read_timeout: Duration::from_millis(config.modbus_read_timeout_ms),
        delay_on_connect: Duration::from_millis(config.modbus_delay_on_connect_ms),
        poll_delay: Duration::from_millis(config.modbus_poll_delay_ms),
        probe_address: config.modbus_probe_address,
        pinned_style,
        backoff: BackoffConfig {
            base: Duration::from_millis(config.modbus_backoff_base_ms),
            max: Duration::from_millis(config.modbus_backoff_max_ms),
            ..BackoffConfig::default()
        },
        failed_polls_for_disconnect: config.modbus_failed_polls_for_disconnect,
    })
}

pub fn pvoutput_config(config: &AppConfig) -> PvoutputConfig {
    PvoutputConfig {
        base_url: config.pvoutput_base_url.clone(),
        api_key: config.pvoutput_api_key.clone(),
        system_id: config.pvoutput_system_id.clone(),
        timeout: Duration::from_secs(config.upload_timeout_seconds),
        extended: config.pvoutput_extended,
        retry: RetryPolicy {
            max_attempts: config.upload_max_attempts,
            backoff: Duration::from_millis(config.upload_backoff_ms),
            ..RetryPolicy::default()
        },
    }
}

pub fn scheduler_config(config: &AppConfig) -> SchedulerConfig {
    SchedulerConfig::new(Duration::from_secs(config.upload_interval_minutes * 60))
}

/// 尝试连接逆变器一次（含调用约定探测）。
pub async fn validate_device(connection: &ConnectionManager) -> Result<(), ValidationError> {
    connection.connect().await?;
    let health = connection.health();
    info!(
        target: "ems.bridge",
        endpoint = %health.state.endpoint,
        style = ?health.state.parameter_style,
        "device_validated"
    );
    Ok(())
}

/// 以给定快照向 PVOutput 提交一次状态。
pub async fn validate_upload(
    uploader: &dyn StatusUploader,
    snapshot: &AggregatedSnapshot,
) -> Result<UploadRecord, ValidationError> {
    let record = uploader.upload(snapshot).await?;
    info!(
        target: "ems.bridge",
        status = ?record.http_status,
        attempts = record.attempts,
        "upload_validated"
    );
    Ok(record)
}
