//! 运行期数据：轮询快照、聚合结果与上传记录
//!
//! 快照只在整轮读取成功时产生；`StatusPayload` 即 PVOutput 表单字段。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// 一次完整轮询得到的快照（所有寄存器均读取成功）。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl Snapshot {
    pub fn new(timestamp: DateTime<Utc>, values: BTreeMap<String, f64>) -> Self {
        Self { timestamp, values }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }
}

/// 附加滚动平均、累计电量与派生字段后的快照。
///
/// `normalized_kwh_per_kw` / `efficiency_kwh_per_kw` 只在上传取数时计算，
/// 轮询路径上始终为 `None`。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedSnapshot {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
    pub instantaneous_power_kw: Option<f64>,
    pub average_power_kw: Option<f64>,
    /// 参与平均的样本数；为 0 时平均值回退为最近一次瞬时值
    pub sample_count: u64,
    pub cumulative_energy_kwh: Option<f64>,
    pub energy_consumed_kwh: Option<f64>,
    pub power_consumed_kw: Option<f64>,
    pub temperature_c: Option<f64>,
    pub voltage_v: Option<f64>,
    pub normalized_kwh_per_kw: Option<f64>,
    pub efficiency_kwh_per_kw: Option<f64>,
}

/// PVOutput `addstatus` 请求字段。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusPayload {
    /// 日期 yyyymmdd
    pub d: String,
    /// 时间 hh:mm
    pub t: String,
    /// 发电量（Wh）
    pub v1: Option<i64>,
    /// 发电功率（W）
    pub v2: Option<i64>,
    /// 用电量（Wh）
    pub v3: Option<i64>,
    /// 用电功率（W）
    pub v4: Option<i64>,
    /// 温度（°C）
    pub v5: Option<f64>,
    /// 电压（V）
    pub v6: Option<f64>,
    /// 扩展字段：归一化发电量（kWh/kW）
    pub v7: Option<f64>,
    /// 扩展字段：瞬时发电功率（W）
    pub v8: Option<i64>,
    /// 扩展字段：效率（kWh/kW）
    pub v9: Option<f64>,
}

impl StatusPayload {
    /// 转为表单字段，省略空值。
    pub fn to_form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![("d", self.d.clone()), ("t", self.t.clone())];
        let integers = [
            ("v1", self.v1),
            ("v2", self.v2),
            ("v3", self.v3),
            ("v4", self.v4),
        ];
        form.extend(
            integers
                .into_iter()
                .filter_map(|(name, value)| value.map(|value| (name, value.to_string()))),
        );
        let decimals = [("v5", self.v5), ("v6", self.v6), ("v7", self.v7)];
        form.extend(
            decimals
                .into_iter()
                .filter_map(|(name, value)| value.map(|value| (name, format_decimal(value)))),
        );
        if let Some(v8) = self.v8 {
            form.push(("v8", v8.to_string()));
        }
        if let Some(v9) = self.v9 {
            form.push(("v9", format_decimal(v9)));
        }
        form
    }
}

fn format_decimal(value: f64) -> String {
    let formatted = format!("{:.3}", value);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// 单次上传结果分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Success,
    Rejected,
    TransientFailure,
}

/// 一次上传尝试的记录（仅用于日志与最近状态展示）。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadRecord {
    pub scheduled_at: DateTime<Utc>,
    pub payload: StatusPayload,
    pub outcome: UploadOutcome,
    pub http_status: Option<u16>,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_skips_missing_values() {
        let payload = StatusPayload {
            d: "20240102".to_string(),
            t: "12:05".to_string(),
            v1: Some(4200),
            v2: Some(1500),
            v5: Some(41.5),
            v6: Some(240.0),
            ..StatusPayload::default()
        };
        let form = payload.to_form();
        assert_eq!(
            form,
            vec![
                ("d", "20240102".to_string()),
                ("t", "12:05".to_string()),
                ("v1", "4200".to_string()),
                ("v2", "1500".to_string()),
                ("v5", "41.5".to_string()),
                ("v6", "240".to_string()),
            ]
        );
    }

    #[test]
    fn snapshot_get_returns_value() {
        let mut values = BTreeMap::new();
        values.insert("pv_power_now".to_string(), 1.25);
        let snapshot = Snapshot::new(Utc::now(), values);
        assert_eq!(snapshot.get("pv_power_now"), Some(1.25));
        assert_eq!(snapshot.get("load_power"), None);
    }
}
