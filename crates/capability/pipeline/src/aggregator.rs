use chrono::{Local, NaiveDate};
use domain::{AggregatedSnapshot, DeviceProfile, PvoutputField, Snapshot};
use ems_telemetry::record_counter_reset;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 发电功率滚动窗口（自上次上传以来）。
#[derive(Debug, Default, Clone, Copy)]
struct RollingPower {
    sum: f64,
    count: u64,
    last: Option<f64>,
}

impl RollingPower {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.last = Some(value);
    }

    /// 平均值；窗口为空时回退为最近一次瞬时值。
    fn average(&self) -> Option<f64> {
        if self.count == 0 {
            self.last
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// 当日累计发电量。
///
/// 同一天内读数下降视为设备计数器复位：以新读数为基线重新上报，不叠加复位前的累计量。
/// 跨本地自然日时清空跟踪状态。
#[derive(Debug, Default, Clone)]
struct EnergyCounter {
    day: Option<NaiveDate>,
    last_reading: Option<f64>,
}

impl EnergyCounter {
    fn update(&mut self, reading: f64, day: NaiveDate) -> f64 {
        if self.day != Some(day) {
            if self.day.is_some() {
                info!(target: "ems.pipeline", day = %day, "energy_day_rollover");
            }
            self.day = Some(day);
            self.last_reading = None;
        }
        if let Some(last) = self.last_reading {
            if reading < last {
                warn!(
                    target: "ems.pipeline",
                    previous = last,
                    reading,
                    "energy_counter_reset"
                );
                record_counter_reset();
            }
        }
        self.last_reading = Some(reading);
        reading
    }
}

/// 指标聚合器（滚动状态的唯一所有者）。
///
/// 通过 [`crate::AggregatorHandle`] 在专属任务中使用，不在任务间共享。
#[derive(Debug)]
pub struct Aggregator {
    profile: Arc<DeviceProfile>,
    rated_system_size_kw: Option<f64>,
    power: RollingPower,
    energy: EnergyCounter,
    latest: Option<AggregatedSnapshot>,
}

impl Aggregator {
    pub fn new(profile: Arc<DeviceProfile>, rated_system_size_kw: Option<f64>) -> Self {
        Self {
            profile,
            rated_system_size_kw: rated_system_size_kw.filter(|kw| kw.is_finite() && *kw > 0.0),
            power: RollingPower::default(),
            energy: EnergyCounter::default(),
            latest: None,
        }
    }

    /// 合并一次轮询快照。
    pub fn ingest(&mut self, snapshot: Snapshot) -> AggregatedSnapshot {
        let power = self.metric(&snapshot, PvoutputField::PowerGeneration);
        if let Some(power) = power {
            self.power.push(power);
        }

        let day = snapshot.timestamp.with_timezone(&Local).date_naive();
        let cumulative = self
            .metric(&snapshot, PvoutputField::EnergyGeneration)
            .map(|reading| self.energy.update(reading, day));

        let aggregated = AggregatedSnapshot {
            timestamp: snapshot.timestamp,
            instantaneous_power_kw: power,
            average_power_kw: self.power.average(),
            sample_count: self.power.count,
            cumulative_energy_kwh: cumulative,
            energy_consumed_kwh: self.metric(&snapshot, PvoutputField::EnergyConsumption),
            power_consumed_kw: self.metric(&snapshot, PvoutputField::PowerConsumption),
            temperature_c: self.metric(&snapshot, PvoutputField::Temperature),
            voltage_v: self.metric(&snapshot, PvoutputField::Voltage),
            normalized_kwh_per_kw: None,
            efficiency_kwh_per_kw: None,
            values: snapshot.values,
        };
        debug!(
            target: "ems.pipeline",
            samples = aggregated.sample_count,
            average_kw = ?aggregated.average_power_kw,
            cumulative_kwh = ?aggregated.cumulative_energy_kwh,
            "snapshot_aggregated"
        );
        self.latest = Some(aggregated.clone());
        aggregated
    }

    /// 取出用于上传的快照并重置滚动窗口（无论上传结果如何）。
    pub fn take_for_upload(&mut self) -> Option<AggregatedSnapshot> {
        let average = self.power.average();
        let samples = self.power.count;
        self.power.reset();

        let mut snapshot = self.latest.clone()?;
        snapshot.average_power_kw = average;
        snapshot.sample_count = samples;
        if let (Some(energy), Some(rated)) = (snapshot.cumulative_energy_kwh, self.rated_system_size_kw)
        {
            let normalized = energy / rated;
            snapshot.normalized_kwh_per_kw = Some(normalized);
            snapshot.efficiency_kwh_per_kw = Some((normalized * 1000.0).round() / 1000.0);
        }
        Some(snapshot)
    }

    /// 最近一次聚合结果（不影响滚动窗口）。
    pub fn latest(&self) -> Option<&AggregatedSnapshot> {
        self.latest.as_ref()
    }

    fn metric(&self, snapshot: &Snapshot, field: PvoutputField) -> Option<f64> {
        self.profile
            .key_for(field)
            .and_then(|key| snapshot.get(key))
            .filter(|value| value.is_finite())
    }
}
