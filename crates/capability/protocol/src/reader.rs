//! 按设备画像读取寄存器并生成快照
//!
//! 画像中的寄存器按地址排序后切分为连续块，每块一次请求（不超过单次上限）。
//! 任意一块失败则整次快照作废，不会产出部分快照。

use crate::codec;
use crate::connection::RegisterSource;
use crate::error::ReadError;
use chrono::{DateTime, Duration, Utc};
use domain::{DeviceProfile, RegisterDefinition, Snapshot};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::debug;

/// Modbus 单次读取保持寄存器的协议上限
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// 一次读取请求覆盖的连续寄存器段。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock {
    pub start: u16,
    pub count: u16,
    /// 该块包含的寄存器定义（在画像寄存器列表中的下标范围）
    pub definitions: Range<usize>,
}

/// 将已按地址排序的寄存器切分为连续块。
///
/// 出现地址空洞或加入下一个寄存器会超过 `max_per_read` 时开启新块。
pub fn partition(registers: &[RegisterDefinition], max_per_read: u16) -> Vec<RegisterBlock> {
    let max_per_read = max_per_read.clamp(1, MAX_REGISTERS_PER_READ);
    let mut blocks: Vec<RegisterBlock> = Vec::new();

    for (index, register) in registers.iter().enumerate() {
        let length = u16::from(register.length);
        if let Some(block) = blocks.last_mut() {
            let block_end = u32::from(block.start) + u32::from(block.count);
            let contiguous = u32::from(register.address) == block_end;
            if contiguous && block.count + length <= max_per_read {
                block.count += length;
                block.definitions.end = index + 1;
                continue;
            }
        }
        blocks.push(RegisterBlock {
            start: register.address,
            count: length,
            definitions: index..index + 1,
        });
    }
    blocks
}

/// 寄存器读取器
///
/// 同一读取器产出的快照时间戳严格递增。
#[derive(Debug)]
pub struct RegisterReader {
    max_registers_per_read: u16,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Default for RegisterReader {
    fn default() -> Self {
        Self::new(MAX_REGISTERS_PER_READ)
    }
}

impl RegisterReader {
    pub fn new(max_registers_per_read: u16) -> Self {
        Self {
            max_registers_per_read,
            last_timestamp: None,
        }
    }

    /// 读取画像中的全部寄存器并计算派生指标。
    pub async fn read_profile<S>(
        &mut self,
        profile: &DeviceProfile,
        source: &S,
    ) -> Result<Snapshot, ReadError>
    where
        S: RegisterSource + ?Sized,
    {
        let registers = profile.registers();
        let mut values = BTreeMap::new();

        for block in partition(registers, self.max_registers_per_read) {
            let words = source
                .read_registers(block.start, block.count)
                .await
                .and_then(|words| {
                    if words.len() < usize::from(block.count) {
                        Err(ReadError::ShortResponse {
                            expected: block.count,
                            actual: words.len(),
                        })
                    } else {
                        Ok(words)
                    }
                })
                .map_err(|err| ReadError::Range {
                    start: block.start,
                    count: block.count,
                    source: Box::new(err),
                })?;

            for definition in &registers[block.definitions.clone()] {
                let offset = usize::from(definition.address - block.start);
                let slice = &words[offset..offset + usize::from(definition.length)];
                let value = codec::decode(definition, slice).map_err(|err| ReadError::Decode {
                    key: definition.key.clone(),
                    reason: err.to_string(),
                })?;
                values.insert(definition.key.clone(), value);
            }
        }

        for derived in profile.derived() {
            let sum: Option<f64> = derived
                .sources
                .iter()
                .map(|key| values.get(key).copied())
                .sum();
            if let Some(sum) = sum {
                values.insert(derived.key.clone(), sum);
            }
        }

        let timestamp = self.next_timestamp(Utc::now());
        debug!(
            target: "ems.protocol",
            model = profile.model(),
            metrics = values.len(),
            "snapshot_read"
        );
        Ok(Snapshot::new(timestamp, values))
    }

    fn next_timestamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        timestamp
    }
}
