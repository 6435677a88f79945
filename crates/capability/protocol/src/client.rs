//! 协议客户端抽象
//!
//! `ConnectionManager` 只通过这两个 trait 与底层 Modbus 客户端交互，
//! 生产实现见 [`crate::TokioModbusConnector`]，测试中可替换为模拟设备。

use crate::error::ClientError;
use crate::style::ParameterStyle;
use async_trait::async_trait;

/// 一次保持寄存器读取请求。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u16,
    pub count: u16,
    pub unit_id: u8,
}

/// 已建立会话的寄存器客户端（单个套接字）。
#[async_trait]
pub trait RegisterClient: Send {
    /// 按指定调用约定读取保持寄存器。
    ///
    /// 不支持该约定时必须返回 [`ClientError::StyleMismatch`]，以便探测继续下一个约定。
    async fn read_holding_registers(
        &mut self,
        request: ReadRequest,
        style: ParameterStyle,
    ) -> Result<Vec<u16>, ClientError>;
}

/// 客户端连接器：为端点打开新会话。
#[async_trait]
pub trait ClientConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        unit_id: u8,
    ) -> Result<Box<dyn RegisterClient>, ClientError>;
}
