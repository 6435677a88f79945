//! 设备寄存器画像（DeviceProfile）
//!
//! 描述某一型号逆变器暴露哪些寄存器、如何解码，以及哪些指标参与 PVOutput 上报。
//! 画像在加载时校验一次，之后只读共享（`Arc<DeviceProfile>`），运行期不会修改。
//!
//! ## 画像文件格式
//!
//! ```json
//! {
//!   "H1_G2": {
//!     "registers": [
//!       { "key": "pv1_power", "name": "PV1 Power", "address": 31002,
//!         "data_type": "int16", "scale": 0.001 },
//!       { "key": "solar_energy_today", "name": "Solar Energy Today", "address": 31010,
//!         "data_type": "uint32", "scale": 0.1, "pvoutput_field": "energy_generation" }
//!     ],
//!     "derived": [
//!       { "key": "pv_power_now", "name": "PV Power", "sources": ["pv1_power", "pv2_power"],
//!         "pvoutput_field": "power_generation" }
//!     ]
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// 画像加载/校验错误（启动期致命错误）。
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("profile parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown inverter model: {0}")]
    UnknownModel(String),
    #[error("invalid profile {model}: {reason}")]
    Invalid { model: String, reason: String },
}

/// 寄存器数据类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// 16位有符号整数
    Int16,
    /// 16位无符号整数
    Uint16,
    /// 32位有符号整数（2个寄存器）
    Int32,
    /// 32位无符号整数（2个寄存器）
    Uint32,
    /// 32位浮点数（2个寄存器）
    Float32,
    /// 64位浮点数（4个寄存器）
    Float64,
}

impl DataType {
    /// 该类型占用的寄存器数量。
    pub fn register_count(self) -> u8 {
        match self {
            Self::Int16 | Self::Uint16 => 1,
            Self::Int32 | Self::Uint32 | Self::Float32 => 2,
            Self::Float64 => 4,
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        Self::Uint16
    }
}

/// 多寄存器值的字序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// 高字在前（Modbus 常见约定）
    #[default]
    BigEndian,
    /// 低字在前
    LittleEndian,
}

/// 指标在 PVOutput 上报中的角色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PvoutputField {
    /// 当日累计发电量（kWh）
    EnergyGeneration,
    /// 瞬时发电功率（kW）
    PowerGeneration,
    /// 当日累计用电量（kWh）
    EnergyConsumption,
    /// 瞬时用电功率（kW）
    PowerConsumption,
    /// 逆变器温度（°C）
    Temperature,
    /// 电网电压（V）
    Voltage,
}

/// 单个寄存器定义。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    /// 指标键（快照中的名称）
    pub key: String,
    /// 展示名称
    #[serde(default)]
    pub name: String,
    /// 起始寄存器地址
    pub address: u16,
    /// 寄存器数量；0 表示按数据类型推导
    #[serde(default)]
    pub length: u8,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub word_order: WordOrder,
    /// 缩放系数：value = raw * scale
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub pvoutput_field: Option<PvoutputField>,
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterDefinition {
    /// 最后一个寄存器之后的地址（不含）。
    pub fn end_address(&self) -> u32 {
        u32::from(self.address) + u32::from(self.length)
    }
}

/// 派生指标：若干源指标之和（例如多路 PV 功率合计）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedDefinition {
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub sources: Vec<String>,
    #[serde(default)]
    pub pvoutput_field: Option<PvoutputField>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProfileSpec {
    registers: Vec<RegisterDefinition>,
    #[serde(default)]
    derived: Vec<DerivedDefinition>,
}

/// 已校验的设备画像。
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    model: String,
    registers: Vec<RegisterDefinition>,
    derived: Vec<DerivedDefinition>,
}

impl DeviceProfile {
    /// 构造并校验画像；`length == 0` 的寄存器按数据类型补全长度。
    pub fn new(
        model: impl Into<String>,
        mut registers: Vec<RegisterDefinition>,
        derived: Vec<DerivedDefinition>,
    ) -> Result<Self, ProfileError> {
        for register in &mut registers {
            if register.length == 0 {
                register.length = register.data_type.register_count();
            }
            if register.name.is_empty() {
                register.name = register.key.clone();
            }
        }
        registers.sort_by_key(|register| register.address);
        let profile = Self {
            model: model.into(),
            registers,
            derived,
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// 按地址升序排列的寄存器。
    pub fn registers(&self) -> &[RegisterDefinition] {
        &self.registers
    }

    pub fn derived(&self) -> &[DerivedDefinition] {
        &self.derived
    }

    /// 查找承担指定 PVOutput 角色的指标键。
    pub fn key_for(&self, field: PvoutputField) -> Option<&str> {
        self.registers
            .iter()
            .filter(|register| register.pvoutput_field == Some(field))
            .map(|register| register.key.as_str())
            .chain(
                self.derived
                    .iter()
                    .filter(|derived| derived.pvoutput_field == Some(field))
                    .map(|derived| derived.key.as_str()),
            )
            .next()
    }

    /// 校验画像一致性。
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.registers.is_empty() {
            return Err(self.invalid("no registers defined"));
        }

        let mut keys = HashSet::new();
        let mut roles = HashSet::new();
        for register in &self.registers {
            if !keys.insert(register.key.as_str()) {
                return Err(self.invalid(format!("duplicate key {}", register.key)));
            }
            if register.length != register.data_type.register_count() {
                return Err(self.invalid(format!(
                    "register {} length {} does not match {:?}",
                    register.key, register.length, register.data_type
                )));
            }
            if !register.scale.is_finite() || register.scale == 0.0 {
                return Err(self.invalid(format!("register {} has invalid scale", register.key)));
            }
            if register.end_address() > u32::from(u16::MAX) + 1 {
                return Err(self.invalid(format!(
                    "register {} overflows the address space",
                    register.key
                )));
            }
            if let Some(field) = register.pvoutput_field {
                if !roles.insert(field) {
                    return Err(self.invalid(format!("duplicate pvoutput field {:?}", field)));
                }
            }
        }

        for pair in self.registers.windows(2) {
            if pair[0].end_address() > u32::from(pair[1].address) {
                return Err(self.invalid(format!(
                    "registers {} and {} overlap",
                    pair[0].key, pair[1].key
                )));
            }
        }

        for derived in &self.derived {
            if derived.sources.is_empty() {
                return Err(self.invalid(format!("derived {} has no sources", derived.key)));
            }
            if let Some(missing) = derived
                .sources
                .iter()
                .find(|source| !keys.contains(source.as_str()))
            {
                return Err(self.invalid(format!(
                    "derived {} references unknown key {}",
                    derived.key, missing
                )));
            }
            if !keys.insert(derived.key.as_str()) {
                return Err(self.invalid(format!("duplicate key {}", derived.key)));
            }
            if let Some(field) = derived.pvoutput_field {
                if !roles.insert(field) {
                    return Err(self.invalid(format!("duplicate pvoutput field {:?}", field)));
                }
            }
        }

        for required in [PvoutputField::EnergyGeneration, PvoutputField::PowerGeneration] {
            if !roles.contains(&required) {
                return Err(self.invalid(format!("missing pvoutput field {:?}", required)));
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> ProfileError {
        ProfileError::Invalid {
            model: self.model.clone(),
            reason: reason.into(),
        }
    }
}

/// 按型号索引的画像集合。
#[derive(Debug, Clone, Default)]
pub struct ProfileCatalog {
    profiles: BTreeMap<String, Arc<DeviceProfile>>,
}

impl ProfileCatalog {
    /// 从 JSON 文本解析并逐个校验画像。
    pub fn from_json(json: &str) -> Result<Self, ProfileError> {
        let specs: BTreeMap<String, ProfileSpec> = serde_json::from_str(json)?;
        let mut profiles = BTreeMap::new();
        for (model, spec) in specs {
            let profile = DeviceProfile::new(model.clone(), spec.registers, spec.derived)?;
            profiles.insert(model, Arc::new(profile));
        }
        Ok(Self { profiles })
    }

    /// 从文件加载。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn get(&self, model: &str) -> Result<Arc<DeviceProfile>, ProfileError> {
        self.profiles
            .get(model)
            .cloned()
            .ok_or_else(|| ProfileError::UnknownModel(model.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}
