//! Modbus TCP 客户端实现（tokio-modbus）
//!
//! 自行建立 `TcpStream` 以便关闭 Nagle 算法，再挂接 tokio-modbus 上下文。
//!
//! tokio-modbus 通过 `set_slave` 设置设备号，四种显式约定在这里都映射为逐请求 `set_slave`，
//! `Implicit` 则沿用连接时绑定的设备号；因此该实现不会返回 `StyleMismatch`，
//! 探测总是收敛在优先级最高的 `DeviceIdKeyword`。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let connector = Arc::new(TokioModbusConnector);
//! let manager = ConnectionManager::new(ConnectionConfig::new("192.168.1.100:502", 247), connector);
//! manager.connect().await?;
//! let registers = manager.read_registers(31002, 4).await?;
//! ```

use crate::client::{ClientConnector, ReadRequest, RegisterClient};
use crate::error::ClientError;
use crate::style::ParameterStyle;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_modbus::prelude::*;
use tracing::debug;

/// 基于 tokio-modbus 的连接器
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioModbusConnector;

#[async_trait]
impl ClientConnector for TokioModbusConnector {
    async fn connect(
        &self,
        endpoint: &str,
        unit_id: u8,
    ) -> Result<Box<dyn RegisterClient>, ClientError> {
        let stream = TcpStream::connect(endpoint).await?;
        // 关闭 Nagle，降低请求/响应往返延迟
        stream.set_nodelay(true)?;
        let ctx = tcp::attach_slave(stream, Slave(unit_id));
        debug!(target: "ems.protocol", endpoint = %endpoint, unit_id, "modbus_socket_attached");
        Ok(Box::new(TokioModbusClient { ctx, bound_unit: unit_id }))
    }
}

/// tokio-modbus 会话
pub struct TokioModbusClient {
    ctx: tokio_modbus::client::Context,
    bound_unit: u8,
}

#[async_trait]
impl RegisterClient for TokioModbusClient {
    async fn read_holding_registers(
        &mut self,
        request: ReadRequest,
        style: ParameterStyle,
    ) -> Result<Vec<u16>, ClientError> {
        let unit = if style.carries_unit_id() {
            request.unit_id
        } else {
            self.bound_unit
        };
        self.ctx.set_slave(Slave(unit));

        let registers = self
            .ctx
            .read_holding_registers(request.address, request.count)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
            .map_err(|e| ClientError::Exception(format!("{:?}", e)))?;

        debug!(
            target: "ems.protocol",
            unit,
            register = request.address,
            count = request.count,
            values = ?registers,
            "read modbus registers"
        );
        Ok(registers)
    }
}
