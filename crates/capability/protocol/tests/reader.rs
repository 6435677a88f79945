use async_trait::async_trait;
use domain::{DataType, DerivedDefinition, DeviceProfile, PvoutputField, RegisterDefinition, WordOrder};
use ems_protocol::{ReadError, RegisterReader, RegisterSource, encode};
use std::collections::HashMap;
use std::sync::Mutex;

/// 内存寄存器表；`failing` 中的起始地址读取时返回异常。
#[derive(Default)]
struct MemoryDevice {
    registers: HashMap<u16, u16>,
    failing: Vec<u16>,
    reads: Mutex<Vec<(u16, u16)>>,
}

impl MemoryDevice {
    fn store(&mut self, definition: &RegisterDefinition, value: f64) {
        let words = encode(definition, value).unwrap();
        for (offset, word) in words.into_iter().enumerate() {
            self.registers.insert(definition.address + offset as u16, word);
        }
    }
}

#[async_trait]
impl RegisterSource for MemoryDevice {
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ReadError> {
        self.reads.lock().unwrap().push((address, count));
        if self.failing.contains(&address) {
            return Err(ReadError::Exception {
                address,
                count,
                message: "IllegalDataAddress".to_string(),
            });
        }
        Ok((address..address + count)
            .map(|a| self.registers.get(&a).copied().unwrap_or(0))
            .collect())
    }
}

fn register(
    key: &str,
    address: u16,
    data_type: DataType,
    scale: f64,
    field: Option<PvoutputField>,
) -> RegisterDefinition {
    RegisterDefinition {
        key: key.to_string(),
        name: String::new(),
        address,
        length: 0,
        data_type,
        word_order: WordOrder::BigEndian,
        scale,
        pvoutput_field: field,
    }
}

fn profile() -> DeviceProfile {
    DeviceProfile::new(
        "H1_G2",
        vec![
            register("pv1_power", 31002, DataType::Int16, 0.001, None),
            register("pv2_power", 31003, DataType::Int16, 0.001, None),
            register(
                "solar_energy_today",
                31010,
                DataType::Uint32,
                0.1,
                Some(PvoutputField::EnergyGeneration),
            ),
            register("grid_voltage", 31020, DataType::Uint16, 0.1, Some(PvoutputField::Voltage)),
        ],
        vec![DerivedDefinition {
            key: "pv_power_now".to_string(),
            name: "PV Power".to_string(),
            sources: vec!["pv1_power".to_string(), "pv2_power".to_string()],
            pvoutput_field: Some(PvoutputField::PowerGeneration),
        }],
    )
    .unwrap()
}

fn device(profile: &DeviceProfile) -> MemoryDevice {
    let mut device = MemoryDevice::default();
    let values = [
        ("pv1_power", 1.2),
        ("pv2_power", 0.8),
        ("solar_energy_today", 12.5),
        ("grid_voltage", 231.4),
    ];
    for (key, value) in values {
        let definition = profile
            .registers()
            .iter()
            .find(|r| r.key == key)
            .unwrap();
        device.store(definition, value);
    }
    device
}

#[tokio::test]
async fn snapshot_contains_decoded_and_derived_values() {
    let profile = profile();
    let device = device(&profile);
    let mut reader = RegisterReader::default();

    let snapshot = reader.read_profile(&profile, &device).await.unwrap();

    let close = |key: &str, expected: f64| {
        let value = snapshot.get(key).unwrap();
        assert!((value - expected).abs() < 1e-6, "{key}: {value}");
    };
    close("pv1_power", 1.2);
    close("pv2_power", 0.8);
    close("pv_power_now", 2.0);
    close("solar_energy_today", 12.5);
    close("grid_voltage", 231.4);

    // 三个连续块：31002..31004、31010..31012、31020
    assert_eq!(
        *device.reads.lock().unwrap(),
        vec![(31002, 2), (31010, 2), (31020, 1)]
    );
}

#[tokio::test]
async fn failing_range_yields_no_snapshot() {
    let profile = profile();
    let mut device = device(&profile);
    device.failing.push(31010);
    let mut reader = RegisterReader::default();

    let err = reader.read_profile(&profile, &device).await.unwrap_err();
    match err {
        ReadError::Range { start, count, source } => {
            assert_eq!((start, count), (31010, 2));
            assert!(matches!(*source, ReadError::Exception { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // 失败后不再读取后续块
    assert_eq!(device.reads.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn consecutive_snapshots_have_increasing_timestamps() {
    let profile = profile();
    let device = device(&profile);
    let mut reader = RegisterReader::default();

    let mut previous = reader.read_profile(&profile, &device).await.unwrap().timestamp;
    for _ in 0..5 {
        let next = reader.read_profile(&profile, &device).await.unwrap().timestamp;
        assert!(next > previous);
        previous = next;
    }
}

#[tokio::test]
async fn small_read_limit_splits_contiguous_registers() {
    let profile = profile();
    let device = device(&profile);
    let mut reader = RegisterReader::new(1);

    let snapshot = reader.read_profile(&profile, &device).await.unwrap();
    assert!(snapshot.get("pv_power_now").is_some());
    // 单寄存器上限下两路 PV 分开读取；两寄存器的电量值仍按整值读取
    let reads = device.reads.lock().unwrap().clone();
    assert!(reads.contains(&(31002, 1)));
    assert!(reads.contains(&(31003, 1)));
}
