//! 墙钟对齐的上传调度
//!
//! 首次触发等待到下一个本地时间边界（`interval - (now mod interval)`），
//! 之后按固定周期触发，每次触发时检查与边界的偏差，超过容差则重新对齐。
//! 周期不整除一天时，零点前的最后一段不足一个周期，提前按零点重建定时器。
//! 上传在独立任务中进行；上一次尚未结束时本次直接跳过，不排队。

use crate::pvoutput::StatusUploader;
use chrono::{DateTime, TimeZone, Timelike, Utc};
use domain::{UploadOutcome, UploadRecord};
use ems_pipeline::AggregatorHandle;
use ems_telemetry::{new_tick_id, record_tick_skipped};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

const MILLIS_PER_DAY: u64 = 86_400_000;

/// 调度参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// 快照超过该时长不再上传
    pub max_snapshot_age: Duration,
    /// 触发时刻与墙钟边界的最大允许偏差
    pub drift_tolerance: Duration,
}

impl SchedulerConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_snapshot_age: interval.saturating_mul(2),
            drift_tolerance: Duration::from_secs(2),
        }
    }
}

/// 一次触发的结果。
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// 已尝试上传（记录中包含成功或失败分类）
    Completed(UploadRecord),
    /// 上一次上传仍在进行
    SkippedInFlight,
    /// 尚无快照
    SkippedNoSnapshot,
    /// 最近快照过旧
    SkippedStale { age: Duration },
}

fn millis_since_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> u64 {
    u64::from(now.num_seconds_from_midnight()) * 1000
        + u64::from(now.nanosecond() % 1_000_000_000) / 1_000_000
}

fn interval_millis(interval: Duration) -> u64 {
    (interval.as_millis() as u64).clamp(1, MILLIS_PER_DAY)
}

/// 距离下一个墙钟边界的时长。
///
/// 边界从本地零点起按 `interval` 划分，本地零点本身总是边界；
/// 恰好落在边界上时返回完整周期。
pub fn next_boundary_delay<Tz: TimeZone>(now: &DateTime<Tz>, interval: Duration) -> Duration {
    let interval_ms = interval_millis(interval);
    let elapsed_ms = millis_since_midnight(now);
    let until_grid = interval_ms - elapsed_ms % interval_ms;
    Duration::from_millis(until_grid.min(MILLIS_PER_DAY - elapsed_ms))
}

/// 当前时刻与最近墙钟边界的距离。
fn boundary_drift<Tz: TimeZone>(now: &DateTime<Tz>, interval: Duration) -> Duration {
    let since_last = Duration::from_millis(millis_since_midnight(now) % interval_millis(interval));
    next_boundary_delay(now, interval).min(since_last)
}

/// 下一个边界不足一个完整周期时（周期不整除一天，跨零点）返回到该边界的时长。
fn short_period_ahead<Tz: TimeZone>(
    now: &DateTime<Tz>,
    interval: Duration,
    tolerance: Duration,
) -> Option<Duration> {
    let until_next = next_boundary_delay(now, interval);
    (until_next + tolerance < interval).then_some(until_next)
}

struct SchedulerInner {
    config: SchedulerConfig,
    aggregator: AggregatorHandle,
    uploader: Arc<dyn StatusUploader>,
    in_flight: Arc<Mutex<()>>,
    last_record: watch::Sender<Option<UploadRecord>>,
}

/// 上传调度器
#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<SchedulerInner>,
}

impl UploadScheduler {
    pub fn new(
        config: SchedulerConfig,
        aggregator: AggregatorHandle,
        uploader: Arc<dyn StatusUploader>,
    ) -> Self {
        let (last_record, _) = watch::channel(None);
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                aggregator,
                uploader,
                in_flight: Arc::new(Mutex::new(())),
                last_record,
            }),
        }
    }

    /// 最近一次上传记录。
    pub fn subscribe_records(&self) -> watch::Receiver<Option<UploadRecord>> {
        self.inner.last_record.subscribe()
    }

    /// 手动触发一次上传（与定时触发共用在途保护）。
    pub async fn trigger_now(&self) -> TickOutcome {
        match self.inner.in_flight.clone().try_lock_owned() {
            Ok(guard) => self.upload_locked(guard, "manual").await,
            Err(_) => self.skip_in_flight("manual"),
        }
    }

    /// 运行调度循环直到取消；退出前最多等待一个在途上传结束。
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = self.inner.config.interval;
        let mut ticker = aligned_interval(interval);
        let mut pending: Option<JoinHandle<TickOutcome>> = None;
        info!(
            target: "ems.upload",
            interval_secs = interval.as_secs(),
            "upload_scheduler_started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let drift = boundary_drift(&chrono::Local::now(), interval);
            if drift > self.inner.config.drift_tolerance {
                warn!(
                    target: "ems.upload",
                    drift_ms = drift.as_millis() as u64,
                    "upload_schedule_resynced"
                );
                ticker = aligned_interval(interval);
                continue;
            }

            if pending.as_ref().is_some_and(|handle| handle.is_finished()) {
                pending = None;
            }
            match self.inner.in_flight.clone().try_lock_owned() {
                Ok(guard) => {
                    let scheduler = self.clone();
                    pending = Some(tokio::spawn(async move {
                        scheduler.upload_locked(guard, "scheduled").await
                    }));
                }
                Err(_) => {
                    self.skip_in_flight("scheduled");
                }
            }

            let now = chrono::Local::now();
            if let Some(delay) =
                short_period_ahead(&now, interval, self.inner.config.drift_tolerance)
            {
                info!(
                    target: "ems.upload",
                    delay_ms = delay.as_millis() as u64,
                    "upload_schedule_realigned"
                );
                ticker = interval_starting_in(delay, interval);
            }
        }

        if let Some(handle) = pending {
            if !handle.is_finished() {
                info!(target: "ems.upload", "waiting_for_in_flight_upload");
            }
            let _ = handle.await;
        }
        info!(target: "ems.upload", "upload_scheduler_stopped");
    }

    fn skip_in_flight(&self, trigger: &'static str) -> TickOutcome {
        record_tick_skipped();
        info!(target: "ems.upload", trigger, reason = "in_flight", "upload_tick_skipped");
        TickOutcome::SkippedInFlight
    }

    async fn upload_locked(&self, _guard: OwnedMutexGuard<()>, trigger: &'static str) -> TickOutcome {
        let tick_id = new_tick_id();
        let span = info_span!("upload_tick", tick_id = %tick_id, trigger);
        self.upload_once().instrument(span).await
    }

    async fn upload_once(&self) -> TickOutcome {
        // 无论上传结果如何，取数即重置滚动窗口
        let snapshot = match self.inner.aggregator.take_for_upload().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                record_tick_skipped();
                info!(target: "ems.upload", reason = "no_snapshot", "upload_tick_skipped");
                return TickOutcome::SkippedNoSnapshot;
            }
            Err(err) => {
                record_tick_skipped();
                warn!(target: "ems.upload", error = %err, "upload_tick_skipped");
                return TickOutcome::SkippedNoSnapshot;
            }
        };

        let age = (Utc::now() - snapshot.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age > self.inner.config.max_snapshot_age {
            record_tick_skipped();
            warn!(
                target: "ems.upload",
                reason = "stale_snapshot",
                age_secs = age.as_secs(),
                "upload_tick_skipped"
            );
            return TickOutcome::SkippedStale { age };
        }

        let scheduled_at = Utc::now();
        let record = match self.inner.uploader.upload(&snapshot).await {
            Ok(record) => record,
            Err(err) => UploadRecord {
                scheduled_at,
                payload: self.inner.uploader.payload_for(&snapshot),
                outcome: err.outcome(),
                http_status: err.http_status(),
                attempts: err.attempts(),
            },
        };
        if record.outcome == UploadOutcome::Rejected {
            warn!(
                target: "ems.upload",
                status = ?record.http_status,
                "upload_rejected_check_credentials"
            );
        }
        self.inner.last_record.send_replace(Some(record.clone()));
        TickOutcome::Completed(record)
    }
}

fn aligned_interval(period: Duration) -> Interval {
    interval_starting_in(next_boundary_delay(&chrono::Local::now(), period), period)
}

fn interval_starting_in(delay: Duration, period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate};

    fn at(hour: u32, minute: u32, second: u32, milli: u32) -> DateTime<FixedOffset> {
        let naive = NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_milli_opt(hour, minute, second, milli)
            .unwrap();
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .from_local_datetime(&naive)
            .unwrap()
    }

    #[test]
    fn first_tick_waits_for_next_boundary() {
        let five_minutes = Duration::from_secs(300);
        assert_eq!(
            next_boundary_delay(&at(12, 3, 17, 0), five_minutes),
            Duration::from_secs(103)
        );
        assert_eq!(
            next_boundary_delay(&at(12, 4, 59, 500), five_minutes),
            Duration::from_millis(500)
        );
        assert_eq!(next_boundary_delay(&at(12, 5, 0, 0), five_minutes), five_minutes);
        assert_eq!(
            next_boundary_delay(&at(23, 58, 0, 0), Duration::from_secs(600)),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn drift_measures_distance_to_nearest_boundary() {
        let five_minutes = Duration::from_secs(300);
        assert_eq!(
            boundary_drift(&at(12, 5, 1, 0), five_minutes),
            Duration::from_secs(1)
        );
        assert_eq!(
            boundary_drift(&at(12, 4, 58, 0), five_minutes),
            Duration::from_secs(2)
        );
        assert_eq!(
            boundary_drift(&at(12, 7, 30, 0), five_minutes),
            Duration::from_secs(150)
        );
    }

    #[test]
    fn local_midnight_is_a_boundary_for_uneven_intervals() {
        let seven_minutes = Duration::from_secs(420);
        // 23:55 = 205 * 7 分钟，之后的下一个边界是零点而不是 00:02
        assert_eq!(
            next_boundary_delay(&at(23, 55, 0, 0), seven_minutes),
            Duration::from_secs(300)
        );
        assert_eq!(
            boundary_drift(&at(23, 55, 1, 0), seven_minutes),
            Duration::from_secs(1)
        );
        assert_eq!(
            boundary_drift(&at(23, 59, 59, 0), seven_minutes),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn schedule_realigns_only_before_a_short_period() {
        let tolerance = Duration::from_secs(2);
        let seven_minutes = Duration::from_secs(420);
        assert_eq!(
            short_period_ahead(&at(23, 55, 0, 20), seven_minutes, tolerance),
            Some(Duration::from_millis(299_980))
        );
        assert_eq!(
            short_period_ahead(&at(12, 1, 0, 20), seven_minutes, tolerance),
            None
        );
        let five_minutes = Duration::from_secs(300);
        assert_eq!(
            short_period_ahead(&at(23, 55, 0, 20), five_minutes, tolerance),
            None
        );
    }
}
