//! 连接状态相关类型定义

use crate::style::ParameterStyle;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// 连接生命周期状态
///
/// `Disconnected → Connecting → Connected → Reconnecting → Disconnected`，
/// 仅显式 `close()` 进入终态 `Closed`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// 最近一次错误的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    Connect,
    Timeout,
    Io,
    Exception,
    StyleMismatch,
    StyleDetection,
}

/// 连接状态（每个设备唯一一份，由 `ConnectionManager` 独占修改）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub endpoint: String,
    pub status: ConnectionStatus,
    pub parameter_style: Option<ParameterStyle>,
    pub last_error: Option<ConnectionErrorKind>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ConnectionState {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            status: ConnectionStatus::Disconnected,
            parameter_style: None,
            last_error: None,
            last_activity: None,
        }
    }
}

/// 对外发布的健康视图（只读副本）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    /// 连续失败次数未达阈值即视为可用
    pub available: bool,
    pub consecutive_failures: u32,
    pub last_error_message: Option<String>,
}

impl ConnectionHealth {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::new(endpoint),
            available: true,
            consecutive_failures: 0,
            last_error_message: None,
        }
    }
}
