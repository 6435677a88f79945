//! # 协议通信能力模块
//!
//! 逆变器 Modbus TCP 采集：
//! - **连接管理**：单套接字、状态机、指数退避重连、可用性判定
//! - **调用约定探测**：首次连接时探测客户端接受的参数风格并缓存
//! - **寄存器读取**：按设备画像切分连续块读取，解码为工程值
//!
//! ## 架构设计
//!
//! ```text
//! DeviceProfile
//!       │
//!       ▼
//! RegisterReader ──read_registers──▶ ConnectionManager
//!       │                                  │
//!       │                          ClientConnector / RegisterClient
//!       │                                  │
//!       ▼                                  ▼
//!   Snapshot                      TokioModbusConnector (tokio-modbus)
//! ```
//!
//! ## 调用约定优先级
//!
//! `device_id`（数量也按关键字传递）→ `slave` → `unit` → 位置参数 → 隐式绑定。
//! 可通过配置固定某一约定以跳过探测。

mod backoff;
mod client;
mod codec;
mod connection;
mod error;
mod modbus_tcp;
mod reader;
mod style;
mod types;

pub use backoff::BackoffConfig;
pub use client::{ClientConnector, ReadRequest, RegisterClient};
pub use codec::{DecodeError, decode, decode_raw, encode};
pub use connection::{ConnectionConfig, ConnectionManager, RegisterSource};
pub use error::{ClientError, ConnectionError, ReadError};
pub use modbus_tcp::{TokioModbusClient, TokioModbusConnector};
pub use reader::{MAX_REGISTERS_PER_READ, RegisterBlock, RegisterReader, partition};
pub use style::{ParameterStyle, UnknownParameterStyle};
pub use types::*;
