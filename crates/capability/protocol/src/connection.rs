//! Modbus 连接管理
//!
//! 每个设备一个 `ConnectionManager`，独占一个套接字与一份 [`ConnectionState`]：
//!
//! - 首次连接时按固定优先级探测调用约定，成功后缓存，重连时沿用
//! - 连续两次签名不匹配才丢弃缓存并在下次重连时重新探测
//! - IO 错误或超时进入 `Reconnecting`，下一次连接前按指数退避（带抖动）等待
//! - 每次请求/响应在同一把互斥锁内完成，调用方不会交错帧；退避与连接后等待不占用该锁

use crate::backoff::BackoffConfig;
use crate::client::{ClientConnector, ReadRequest, RegisterClient};
use crate::error::{ClientError, ConnectionError, ReadError};
use crate::style::ParameterStyle;
use crate::types::{ConnectionErrorKind, ConnectionHealth, ConnectionState, ConnectionStatus};
use async_trait::async_trait;
use chrono::Utc;
use ems_telemetry::{record_reconnect, record_style_probe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 连续签名不匹配达到该次数后放弃缓存的调用约定
const STYLE_MISMATCH_LIMIT: u32 = 2;

/// 连接参数
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// `host:port`
    pub endpoint: String,
    /// Modbus 设备号
    pub unit_id: u8,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// 连接建立后到首个请求之间的最小间隔（部分固件响应慢）
    pub delay_on_connect: Duration,
    /// 每次请求后的间隔
    pub poll_delay: Duration,
    /// 调用约定探测使用的寄存器
    pub probe_address: u16,
    /// 固定调用约定，设置后跳过探测
    pub pinned_style: Option<ParameterStyle>,
    pub backoff: BackoffConfig,
    /// 连续失败多少次后标记为不可用
    pub failed_polls_for_disconnect: u32,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>, unit_id: u8) -> Self {
        Self {
            endpoint: endpoint.into(),
            unit_id,
            connect_timeout: Duration::from_millis(5000),
            read_timeout: Duration::from_millis(3000),
            delay_on_connect: Duration::from_millis(1000),
            poll_delay: Duration::from_millis(30),
            probe_address: 31006,
            pinned_style: None,
            backoff: BackoffConfig::default(),
            failed_polls_for_disconnect: 5,
        }
    }
}

/// 寄存器读取抽象（`RegisterReader` 只依赖该接口）
#[async_trait]
pub trait RegisterSource: Send + Sync {
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ReadError>;
}

enum ExchangeError {
    NotConnected,
    Timeout,
    Client(ClientError),
}

struct Session {
    state: ConnectionState,
    client: Option<Box<dyn RegisterClient>>,
    reconnect_attempt: u32,
    /// 退避结束时间；`None` 表示可立即连接
    retry_at: Option<Instant>,
    style_mismatches: u32,
    consecutive_failures: u32,
    available: bool,
    last_error_message: Option<String>,
}

/// 单设备连接管理器
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn ClientConnector>,
    session: Mutex<Session>,
    /// 串行化重连，避免并发调用方各自打开套接字
    connect_gate: Mutex<()>,
    health: watch::Sender<ConnectionHealth>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn ClientConnector>) -> Self {
        Self::with_cancellation(config, connector, CancellationToken::new())
    }

    /// `cancel` 触发后，退避与连接后等待立即放弃。
    pub fn with_cancellation(
        config: ConnectionConfig,
        connector: Arc<dyn ClientConnector>,
        cancel: CancellationToken,
    ) -> Self {
        let (health, _) = watch::channel(ConnectionHealth::new(config.endpoint.clone()));
        let session = Session {
            state: ConnectionState::new(config.endpoint.clone()),
            client: None,
            reconnect_attempt: 0,
            retry_at: None,
            style_mismatches: 0,
            consecutive_failures: 0,
            available: true,
            last_error_message: None,
        };
        Self {
            config,
            connector,
            session: Mutex::new(session),
            connect_gate: Mutex::new(()),
            health,
            cancel,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// 当前健康视图。
    pub fn health(&self) -> ConnectionHealth {
        self.health.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<ConnectionHealth> {
        self.health.subscribe()
    }

    /// 建立连接（已连接时直接返回）。
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.ensure_connected().await.map(drop)
    }

    /// 读取保持寄存器；未连接时先连接。
    pub async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ReadError> {
        let mut session = match self.ensure_connected().await {
            Ok(session) => session,
            Err(err) => {
                if !matches!(err, ConnectionError::Closed | ConnectionError::Cancelled) {
                    let mut session = self.session.lock().await;
                    let kind = connection_error_kind(&err);
                    self.record_failure(&mut session, kind, err.to_string());
                }
                return Err(err.into());
            }
        };

        let style = session
            .state
            .parameter_style
            .unwrap_or(ParameterStyle::PRIORITY[0]);
        let request = ReadRequest {
            address,
            count,
            unit_id: self.config.unit_id,
        };

        let result = self.exchange(&mut session, request, style).await;
        // 只累计连续的签名不匹配
        if !matches!(result, Err(ExchangeError::Client(ClientError::StyleMismatch(_)))) {
            session.style_mismatches = 0;
        }
        match result {
            Ok(registers) if registers.len() >= usize::from(count) => {
                self.record_success(&mut session);
                Ok(registers)
            }
            Ok(registers) => {
                let err = ReadError::ShortResponse {
                    expected: count,
                    actual: registers.len(),
                };
                self.record_failure(&mut session, ConnectionErrorKind::Exception, err.to_string());
                Err(err)
            }
            Err(ExchangeError::Client(ClientError::StyleMismatch(rejected))) => {
                session.style_mismatches += 1;
                if session.style_mismatches >= STYLE_MISMATCH_LIMIT {
                    warn!(
                        target: "ems.protocol",
                        endpoint = %self.config.endpoint,
                        style = %rejected,
                        "parameter_style_invalidated"
                    );
                    session.state.parameter_style = None;
                    session.style_mismatches = 0;
                    self.drop_client(&mut session);
                }
                let err = ReadError::StyleMismatch(rejected);
                self.record_failure(&mut session, ConnectionErrorKind::StyleMismatch, err.to_string());
                Err(err)
            }
            Err(ExchangeError::Client(ClientError::Exception(message))) => {
                let err = ReadError::Exception {
                    address,
                    count,
                    message,
                };
                self.record_failure(&mut session, ConnectionErrorKind::Exception, err.to_string());
                Err(err)
            }
            Err(ExchangeError::Client(err)) => {
                self.drop_client(&mut session);
                let err = ReadError::Io(err.to_string());
                self.record_failure(&mut session, ConnectionErrorKind::Io, err.to_string());
                Err(err)
            }
            Err(ExchangeError::Timeout) => {
                self.drop_client(&mut session);
                let err = ReadError::Timeout(self.config.read_timeout.as_millis() as u64);
                self.record_failure(&mut session, ConnectionErrorKind::Timeout, err.to_string());
                Err(err)
            }
            Err(ExchangeError::NotConnected) => {
                self.drop_client(&mut session);
                Err(ReadError::Io("session lost".to_string()))
            }
        }
    }

    /// 关闭连接（终态）。
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut session = self.session.lock().await;
        session.client = None;
        session.retry_at = None;
        session.state.status = ConnectionStatus::Closed;
        self.publish(&session);
        info!(target: "ems.protocol", endpoint = %self.config.endpoint, "modbus_connection_closed");
    }

    /// 返回已连接会话的锁。
    ///
    /// 重连由 `connect_gate` 串行化；退避等待与连接后等待期间不持有会话锁。
    async fn ensure_connected(&self) -> Result<MutexGuard<'_, Session>, ConnectionError> {
        {
            let session = self.session.lock().await;
            if self.is_ready(&session)? {
                return Ok(session);
            }
        }

        let _gate = self.connect_gate.lock().await;
        let (attempt, retry_at) = {
            let session = self.session.lock().await;
            if self.is_ready(&session)? {
                return Ok(session);
            }
            (session.reconnect_attempt, session.retry_at)
        };

        if let Some(retry_at) = retry_at {
            info!(
                target: "ems.protocol",
                endpoint = %self.config.endpoint,
                attempt,
                delay_ms = retry_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "modbus_reconnect_backoff"
            );
            self.sleep_until_or_cancel(retry_at).await?;
        }
        if attempt > 0 {
            record_reconnect();
        }

        {
            let mut session = self.session.lock().await;
            if self.is_ready(&session)? {
                return Ok(session);
            }
            self.set_status(&mut session, ConnectionStatus::Connecting);
        }

        let client = match self.open_client().await {
            Ok(client) => client,
            Err(err) => return Err(self.connect_failed(err).await),
        };

        let mut session = self.session.lock().await;
        if session.state.status == ConnectionStatus::Closed {
            return Err(ConnectionError::Closed);
        }
        session.client = Some(client);
        if session.state.parameter_style.is_none() {
            let detected = match self.config.pinned_style {
                Some(style) => Ok(style),
                None => self.detect_style(&mut session).await,
            };
            match detected {
                Ok(style) => {
                    session.state.parameter_style = Some(style);
                    session.style_mismatches = 0;
                }
                Err(err) => {
                    drop(session);
                    return Err(self.connect_failed(err).await);
                }
            }
        }

        session.reconnect_attempt = 0;
        session.retry_at = None;
        session.state.last_activity = Some(Utc::now());
        self.set_status(&mut session, ConnectionStatus::Connected);
        info!(
            target: "ems.protocol",
            endpoint = %self.config.endpoint,
            style = ?session.state.parameter_style,
            "modbus_connected"
        );
        Ok(session)
    }

    fn is_ready(&self, session: &Session) -> Result<bool, ConnectionError> {
        match session.state.status {
            ConnectionStatus::Closed => Err(ConnectionError::Closed),
            ConnectionStatus::Connected if session.client.is_some() => Ok(true),
            _ if self.cancel.is_cancelled() => Err(ConnectionError::Cancelled),
            _ => Ok(false),
        }
    }

    /// 打开套接字并等待设备就绪（不持有会话锁）。
    async fn open_client(&self) -> Result<Box<dyn RegisterClient>, ConnectionError> {
        let endpoint = &self.config.endpoint;
        let connect = self.connector.connect(endpoint, self.config.unit_id);
        let client = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => {
                return Err(ConnectionError::Connect {
                    endpoint: endpoint.clone(),
                    message: err.to_string(),
                });
            }
            Err(_) => {
                return Err(ConnectionError::Timeout(format!(
                    "connect to {} after {}ms",
                    endpoint,
                    self.config.connect_timeout.as_millis()
                )));
            }
        };

        if !self.config.delay_on_connect.is_zero() {
            self.sleep_or_cancel(self.config.delay_on_connect).await?;
        }
        Ok(client)
    }

    async fn connect_failed(&self, err: ConnectionError) -> ConnectionError {
        let mut session = self.session.lock().await;
        session.client = None;
        if session.state.status == ConnectionStatus::Closed {
            return err;
        }
        if matches!(err, ConnectionError::Cancelled) {
            self.set_status(&mut session, ConnectionStatus::Disconnected);
            return err;
        }
        let attempt = session.reconnect_attempt.saturating_add(1);
        self.schedule_retry(&mut session, attempt);
        session.state.last_error = Some(connection_error_kind(&err));
        self.set_status(&mut session, ConnectionStatus::Disconnected);
        warn!(
            target: "ems.protocol",
            endpoint = %self.config.endpoint,
            error = %err,
            "modbus_connect_failed"
        );
        err
    }

    async fn detect_style(&self, session: &mut Session) -> Result<ParameterStyle, ConnectionError> {
        let request = ReadRequest {
            address: self.config.probe_address,
            count: 1,
            unit_id: self.config.unit_id,
        };
        let mut tried = Vec::with_capacity(ParameterStyle::PRIORITY.len());

        for style in ParameterStyle::PRIORITY {
            record_style_probe();
            tried.push(style);
            match self.exchange(session, request, style).await {
                Ok(_) => {
                    info!(
                        target: "ems.protocol",
                        endpoint = %self.config.endpoint,
                        style = %style,
                        "parameter_style_detected"
                    );
                    return Ok(style);
                }
                // 设备异常说明调用本身被接受
                Err(ExchangeError::Client(ClientError::Exception(message))) => {
                    info!(
                        target: "ems.protocol",
                        endpoint = %self.config.endpoint,
                        style = %style,
                        exception = %message,
                        "parameter_style_detected"
                    );
                    return Ok(style);
                }
                Err(ExchangeError::Client(ClientError::StyleMismatch(_))) => {
                    debug!(
                        target: "ems.protocol",
                        endpoint = %self.config.endpoint,
                        style = %style,
                        "parameter_style_rejected"
                    );
                }
                Err(ExchangeError::Timeout) => {
                    return Err(ConnectionError::Timeout(format!(
                        "probe read at {} with {}",
                        request.address, style
                    )));
                }
                Err(ExchangeError::Client(err)) => {
                    return Err(ConnectionError::Connect {
                        endpoint: self.config.endpoint.clone(),
                        message: err.to_string(),
                    });
                }
                Err(ExchangeError::NotConnected) => {
                    return Err(ConnectionError::Connect {
                        endpoint: self.config.endpoint.clone(),
                        message: "session lost during probe".to_string(),
                    });
                }
            }
        }

        warn!(
            target: "ems.protocol",
            endpoint = %self.config.endpoint,
            tried = ?tried,
            "parameter_style_detection_failed"
        );
        Err(ConnectionError::ParameterStyleDetectionFailure { tried })
    }

    /// 一次请求/响应；调用方已持有会话锁。
    async fn exchange(
        &self,
        session: &mut Session,
        request: ReadRequest,
        style: ParameterStyle,
    ) -> Result<Vec<u16>, ExchangeError> {
        let Some(client) = session.client.as_mut() else {
            return Err(ExchangeError::NotConnected);
        };
        let result = tokio::time::timeout(
            self.config.read_timeout,
            client.read_holding_registers(request, style),
        )
        .await;
        if !self.config.poll_delay.is_zero() {
            tokio::time::sleep(self.config.poll_delay).await;
        }
        match result {
            Ok(Ok(registers)) => Ok(registers),
            Ok(Err(err)) => Err(ExchangeError::Client(err)),
            Err(_) => Err(ExchangeError::Timeout),
        }
    }

    async fn sleep_or_cancel(&self, delay: Duration) -> Result<(), ConnectionError> {
        self.sleep_until_or_cancel(Instant::now() + delay).await
    }

    async fn sleep_until_or_cancel(&self, deadline: Instant) -> Result<(), ConnectionError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ConnectionError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Ok(()),
        }
    }

    /// 记录下一次重连的最早时间（从失败时刻起算退避）。
    fn schedule_retry(&self, session: &mut Session, attempt: u32) {
        session.reconnect_attempt = attempt;
        session.retry_at = Some(Instant::now() + self.config.backoff.delay(attempt));
    }

    fn drop_client(&self, session: &mut Session) {
        session.client = None;
        let attempt = session.reconnect_attempt.max(1);
        self.schedule_retry(session, attempt);
        self.set_status(session, ConnectionStatus::Reconnecting);
    }

    fn record_success(&self, session: &mut Session) {
        if !session.available {
            info!(
                target: "ems.protocol",
                endpoint = %self.config.endpoint,
                "connection restored"
            );
        }
        session.available = true;
        session.consecutive_failures = 0;
        session.style_mismatches = 0;
        session.last_error_message = None;
        session.state.last_error = None;
        session.state.last_activity = Some(Utc::now());
        self.publish(session);
    }

    fn record_failure(&self, session: &mut Session, kind: ConnectionErrorKind, message: String) {
        session.consecutive_failures = session.consecutive_failures.saturating_add(1);
        session.state.last_error = Some(kind);
        if session.available && session.consecutive_failures >= self.config.failed_polls_for_disconnect
        {
            warn!(
                target: "ems.protocol",
                endpoint = %self.config.endpoint,
                failures = session.consecutive_failures,
                error = %message,
                "modbus_marked_unavailable"
            );
            session.available = false;
        }
        session.last_error_message = Some(message);
        self.publish(session);
    }

    fn set_status(&self, session: &mut Session, status: ConnectionStatus) {
        session.state.status = status;
        self.publish(session);
    }

    fn publish(&self, session: &Session) {
        self.health.send_replace(ConnectionHealth {
            state: session.state.clone(),
            available: session.available,
            consecutive_failures: session.consecutive_failures,
            last_error_message: session.last_error_message.clone(),
        });
    }
}

#[async_trait]
impl RegisterSource for ConnectionManager {
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ReadError> {
        ConnectionManager::read_registers(self, address, count).await
    }
}

fn connection_error_kind(err: &ConnectionError) -> ConnectionErrorKind {
    match err {
        ConnectionError::Timeout(_) => ConnectionErrorKind::Timeout,
        ConnectionError::ParameterStyleDetectionFailure { .. } => {
            ConnectionErrorKind::StyleDetection
        }
        _ => ConnectionErrorKind::Connect,
    }
}
