//! 调用约定（ParameterStyle）
//!
//! 不同版本的协议客户端以不同方式接收设备地址：关键字 `device_id`（此时数量也必须以关键字传入）、
//! 关键字 `slave`、关键字 `unit`、位置参数，或在客户端上预先绑定。
//! 连接管理器按 [`ParameterStyle::PRIORITY`] 顺序逐一探测，首个未报签名不匹配的约定被缓存。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 设备地址的调用约定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterStyle {
    /// 关键字 `device_id`，数量同样按关键字传入（最新客户端）
    DeviceIdKeyword,
    /// 关键字 `slave`
    SlaveKeyword,
    /// 关键字 `unit`
    UnitKeyword,
    /// 位置参数：地址、数量、设备号
    Positional,
    /// 不传设备号，使用客户端连接时绑定的设备号
    Implicit,
}

impl ParameterStyle {
    /// 探测优先级（固定顺序）。
    pub const PRIORITY: [ParameterStyle; 5] = [
        ParameterStyle::DeviceIdKeyword,
        ParameterStyle::SlaveKeyword,
        ParameterStyle::UnitKeyword,
        ParameterStyle::Positional,
        ParameterStyle::Implicit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceIdKeyword => "device_id_keyword",
            Self::SlaveKeyword => "slave_keyword",
            Self::UnitKeyword => "unit_keyword",
            Self::Positional => "positional",
            Self::Implicit => "implicit",
        }
    }

    /// 数量参数是否也必须按关键字传入。
    pub fn count_as_keyword(self) -> bool {
        matches!(self, Self::DeviceIdKeyword)
    }

    /// 是否在每次请求中显式携带设备号。
    pub fn carries_unit_id(self) -> bool {
        !matches!(self, Self::Implicit)
    }
}

impl fmt::Display for ParameterStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown parameter style: {0}")]
pub struct UnknownParameterStyle(pub String);

impl FromStr for ParameterStyle {
    type Err = UnknownParameterStyle;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "device_id_keyword" | "device_id" => Ok(Self::DeviceIdKeyword),
            "slave_keyword" | "slave" => Ok(Self::SlaveKeyword),
            "unit_keyword" | "unit" => Ok(Self::UnitKeyword),
            "positional" => Ok(Self::Positional),
            "implicit" | "none" => Ok(Self::Implicit),
            _ => Err(UnknownParameterStyle(value.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("slave".parse::<ParameterStyle>().unwrap(), ParameterStyle::SlaveKeyword);
        assert_eq!(
            "Device_ID_Keyword".parse::<ParameterStyle>().unwrap(),
            ParameterStyle::DeviceIdKeyword
        );
        assert!("kwargs".parse::<ParameterStyle>().is_err());
    }

    #[test]
    fn priority_starts_with_device_id() {
        assert_eq!(ParameterStyle::PRIORITY[0], ParameterStyle::DeviceIdKeyword);
        assert_eq!(ParameterStyle::PRIORITY[4], ParameterStyle::Implicit);
        assert!(ParameterStyle::DeviceIdKeyword.count_as_keyword());
        assert!(!ParameterStyle::Implicit.carries_unit_id());
    }
}
