use chrono::Local;
use domain::{AggregatedSnapshot, StatusPayload};

/// 由聚合快照生成 PVOutput 状态字段。
///
/// 日期时间取快照时间的本地时区表示；电量换算为 Wh、功率换算为 W。
/// `extended` 为真时附带 v7~v9（仅捐助账户可用）。
pub fn build_payload(snapshot: &AggregatedSnapshot, extended: bool) -> StatusPayload {
    let local = snapshot.timestamp.with_timezone(&Local);
    let mut payload = StatusPayload {
        d: local.format("%Y%m%d").to_string(),
        t: local.format("%H:%M").to_string(),
        v1: snapshot.cumulative_energy_kwh.map(kilo_to_unit),
        v2: snapshot.average_power_kw.map(kilo_to_unit),
        v3: snapshot.energy_consumed_kwh.map(kilo_to_unit),
        v4: snapshot.power_consumed_kw.map(kilo_to_unit),
        v5: snapshot.temperature_c,
        v6: snapshot.voltage_v,
        ..StatusPayload::default()
    };
    if extended {
        payload.v7 = snapshot.normalized_kwh_per_kw;
        payload.v8 = snapshot.instantaneous_power_kw.map(kilo_to_unit);
        payload.v9 = snapshot.efficiency_kwh_per_kw;
    }
    payload
}

/// PVOutput 至少需要 v1~v4 之一。
pub(crate) fn has_required_fields(payload: &StatusPayload) -> bool {
    payload.v1.is_some() || payload.v2.is_some() || payload.v3.is_some() || payload.v4.is_some()
}

fn kilo_to_unit(value: f64) -> i64 {
    (value * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn snapshot() -> AggregatedSnapshot {
        AggregatedSnapshot {
            timestamp: Local
                .with_ymd_and_hms(2024, 1, 2, 12, 5, 0)
                .single()
                .unwrap()
                .with_timezone(&Utc),
            values: BTreeMap::new(),
            instantaneous_power_kw: Some(1.75),
            average_power_kw: Some(1.5004),
            sample_count: 30,
            cumulative_energy_kwh: Some(4.2),
            energy_consumed_kwh: None,
            power_consumed_kw: None,
            temperature_c: Some(41.5),
            voltage_v: Some(240.1),
            normalized_kwh_per_kw: Some(0.7),
            efficiency_kwh_per_kw: Some(0.7),
        }
    }

    #[test]
    fn payload_converts_units_and_formats_local_time() {
        let payload = build_payload(&snapshot(), false);
        assert_eq!(payload.d, "20240102");
        assert_eq!(payload.t, "12:05");
        assert_eq!(payload.v1, Some(4200));
        assert_eq!(payload.v2, Some(1500));
        assert_eq!(payload.v3, None);
        assert_eq!(payload.v5, Some(41.5));
        assert_eq!(payload.v6, Some(240.1));
        assert_eq!(payload.v7, None);
        assert_eq!(payload.v8, None);
        assert!(has_required_fields(&payload));
    }

    #[test]
    fn extended_fields_are_opt_in() {
        let payload = build_payload(&snapshot(), true);
        assert_eq!(payload.v7, Some(0.7));
        assert_eq!(payload.v8, Some(1750));
        assert_eq!(payload.v9, Some(0.7));
    }

    #[test]
    fn payload_without_energy_or_power_is_not_uploadable() {
        let mut snapshot = snapshot();
        snapshot.cumulative_energy_kwh = None;
        snapshot.average_power_kw = None;
        let payload = build_payload(&snapshot, true);
        assert!(!has_required_fields(&payload));
    }
}
