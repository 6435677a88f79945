//! 追踪初始化与进程级计数指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 基础指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub polls_succeeded: u64,
    pub polls_failed: u64,
    pub reconnects: u64,
    pub style_probes: u64,
    pub uploads_succeeded: u64,
    pub uploads_rejected: u64,
    pub uploads_transient: u64,
    pub upload_attempts: u64,
    pub ticks_skipped: u64,
    pub counter_resets: u64,
}

/// 基础指标。
pub struct TelemetryMetrics {
    polls_succeeded: AtomicU64,
    polls_failed: AtomicU64,
    reconnects: AtomicU64,
    style_probes: AtomicU64,
    uploads_succeeded: AtomicU64,
    uploads_rejected: AtomicU64,
    uploads_transient: AtomicU64,
    upload_attempts: AtomicU64,
    ticks_skipped: AtomicU64,
    counter_resets: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            polls_succeeded: AtomicU64::new(0),
            polls_failed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            style_probes: AtomicU64::new(0),
            uploads_succeeded: AtomicU64::new(0),
            uploads_rejected: AtomicU64::new(0),
            uploads_transient: AtomicU64::new(0),
            upload_attempts: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            counter_resets: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            polls_succeeded: self.polls_succeeded.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            style_probes: self.style_probes.load(Ordering::Relaxed),
            uploads_succeeded: self.uploads_succeeded.load(Ordering::Relaxed),
            uploads_rejected: self.uploads_rejected.load(Ordering::Relaxed),
            uploads_transient: self.uploads_transient.load(Ordering::Relaxed),
            upload_attempts: self.upload_attempts.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            counter_resets: self.counter_resets.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成上传 tick 标识，用于串联同一次上传的日志。
pub fn new_tick_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 记录完整轮询成功次数。
pub fn record_poll_success() {
    metrics().polls_succeeded.fetch_add(1, Ordering::Relaxed);
}

/// 记录轮询失败次数（整次快照丢弃）。
pub fn record_poll_failure() {
    metrics().polls_failed.fetch_add(1, Ordering::Relaxed);
}

/// 记录重连次数。
pub fn record_reconnect() {
    metrics().reconnects.fetch_add(1, Ordering::Relaxed);
}

/// 记录调用约定探测次数。
pub fn record_style_probe() {
    metrics().style_probes.fetch_add(1, Ordering::Relaxed);
}

pub fn record_upload_success() {
    metrics().uploads_succeeded.fetch_add(1, Ordering::Relaxed);
}

pub fn record_upload_rejected() {
    metrics().uploads_rejected.fetch_add(1, Ordering::Relaxed);
}

/// 记录重试耗尽后放弃的上传次数。
pub fn record_upload_transient() {
    metrics().uploads_transient.fetch_add(1, Ordering::Relaxed);
}

/// 记录 HTTP 请求次数（含重试）。
pub fn record_upload_attempt() {
    metrics().upload_attempts.fetch_add(1, Ordering::Relaxed);
}

/// 记录因上传进行中或无可用快照而跳过的 tick。
pub fn record_tick_skipped() {
    metrics().ticks_skipped.fetch_add(1, Ordering::Relaxed);
}

/// 记录设备侧累计计数器复位次数。
pub fn record_counter_reset() {
    metrics().counter_resets.fetch_add(1, Ordering::Relaxed);
}
