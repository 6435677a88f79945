//! 轮询任务：按固定周期读取寄存器快照并交给聚合器。

use domain::{AggregatedSnapshot, DeviceProfile};
use ems_pipeline::{AggregatorHandle, PipelineError};
use ems_protocol::{ConnectionManager, ReadError, RegisterReader};
use ems_telemetry::{record_poll_failure, record_poll_success};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

pub struct Poller {
    connection: Arc<ConnectionManager>,
    reader: RegisterReader,
    profile: Arc<DeviceProfile>,
    aggregator: AggregatorHandle,
    interval: Duration,
}

impl Poller {
    pub fn new(
        connection: Arc<ConnectionManager>,
        profile: Arc<DeviceProfile>,
        aggregator: AggregatorHandle,
        interval: Duration,
        max_registers_per_read: u16,
    ) -> Self {
        Self {
            connection,
            reader: RegisterReader::new(max_registers_per_read),
            profile,
            aggregator,
            interval,
        }
    }

    /// 一次完整轮询；失败时不产出快照，聚合状态保持不变。
    pub async fn poll_once(&mut self) -> Result<AggregatedSnapshot, PollError> {
        let snapshot = match self
            .reader
            .read_profile(&self.profile, self.connection.as_ref())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                record_poll_failure();
                let health = self.connection.health();
                warn!(
                    target: "ems.bridge",
                    error = %err,
                    connection_level = err.is_connection_level(),
                    consecutive_failures = health.consecutive_failures,
                    available = health.available,
                    "poll_failed"
                );
                return Err(err.into());
            }
        };
        record_poll_success();
        let aggregated = self.aggregator.ingest(snapshot).await?;
        debug!(
            target: "ems.bridge",
            power_kw = ?aggregated.instantaneous_power_kw,
            energy_kwh = ?aggregated.cumulative_energy_kwh,
            "poll_succeeded"
        );
        Ok(aggregated)
    }

    /// 运行到取消为止，退出时关闭连接。
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            target: "ems.bridge",
            interval_secs = self.interval.as_secs(),
            endpoint = self.connection.endpoint(),
            "poller_started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(PollError::Pipeline(err)) = self.poll_once().await {
                warn!(target: "ems.bridge", error = %err, "poller_stopping");
                break;
            }
        }

        self.connection.close().await;
        info!(target: "ems.bridge", "poller_stopped");
    }
}
