//! 协议错误类型定义

use crate::style::ParameterStyle;

/// 协议客户端单次调用错误（由 `RegisterClient` 实现返回）
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// 客户端不接受该调用约定（签名不匹配）
    #[error("parameter style {0} not supported by client")]
    StyleMismatch(ParameterStyle),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 传输/协议层错误（帧错误、事务号不符等）
    #[error("transport error: {0}")]
    Transport(String),

    /// 设备返回 Modbus 异常码
    #[error("modbus exception: {0}")]
    Exception(String),
}

/// 连接错误（套接字级）
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// 建立连接失败
    #[error("connect to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    /// 建立连接或探测超时
    #[error("timeout: {0}")]
    Timeout(String),

    /// 所有调用约定均被拒绝（本次连接失败，下次重连重新探测）
    #[error("parameter style detection failed, tried: {tried:?}")]
    ParameterStyleDetectionFailure { tried: Vec<ParameterStyle> },

    /// 连接已被显式关闭
    #[error("connection closed")]
    Closed,

    /// 关停期间放弃等待
    #[error("cancelled")]
    Cancelled,
}

/// 寄存器读取错误
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("not connected: {0}")]
    Connection(#[from] ConnectionError),

    #[error("io error: {0}")]
    Io(String),

    #[error("read timeout after {0}ms")]
    Timeout(u64),

    #[error("modbus exception at {address} (count {count}): {message}")]
    Exception {
        address: u16,
        count: u16,
        message: String,
    },

    #[error("parameter style {0} rejected by client")]
    StyleMismatch(ParameterStyle),

    #[error("short response: expected {expected} registers, got {actual}")]
    ShortResponse { expected: u16, actual: usize },

    /// 某个地址段读取失败（整次快照作废）
    #[error("range {start}+{count} failed: {source}")]
    Range {
        start: u16,
        count: u16,
        #[source]
        source: Box<ReadError>,
    },

    #[error("decode {key} failed: {reason}")]
    Decode { key: String, reason: String },
}

impl ReadError {
    /// 是否由连接层问题导致（会触发重连）
    pub fn is_connection_level(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Io(_) | Self::Timeout(_) => true,
            Self::Range { source, .. } => source.is_connection_level(),
            _ => false,
        }
    }
}
