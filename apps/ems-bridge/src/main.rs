//! 逆变器 Modbus 采集 → PVOutput 上报桥接进程。
//!
//! 运行 `ems-bridge --validate` 只做一次连通性校验（连接、读取、上传各一次）后退出。

mod poller;
mod setup;

use ems_config::AppConfig;
use ems_pipeline::{Aggregator, AggregatorHandle};
use ems_protocol::{ConnectionManager, TokioModbusConnector};
use ems_telemetry::{init_tracing, metrics};
use ems_upload::{PvoutputUploader, UploadScheduler};
use poller::Poller;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    let profile = setup::load_profile(&config)?;
    let shutdown = CancellationToken::new();
    let connection = Arc::new(ConnectionManager::with_cancellation(
        setup::connection_config(&config)?,
        Arc::new(TokioModbusConnector),
        shutdown.child_token(),
    ));
    let (aggregator, aggregator_task) = AggregatorHandle::spawn(Aggregator::new(
        profile.clone(),
        config.rated_system_size_kw,
    ));
    let mut poller = Poller::new(
        connection.clone(),
        profile,
        aggregator.clone(),
        Duration::from_secs(config.poll_interval_seconds),
        config.modbus_max_registers_per_read,
    );

    if std::env::args().any(|arg| arg == "--validate") {
        setup::validate_device(&connection).await?;
        poller.poll_once().await?;
        if config.send_to_pvoutput {
            let uploader = PvoutputUploader::new(setup::pvoutput_config(&config))?;
            if let Some(snapshot) = aggregator.take_for_upload().await? {
                setup::validate_upload(&uploader, &snapshot).await?;
            }
        }
        connection.close().await;
        info!(target: "ems.bridge", "validation_passed");
        return Ok(());
    }

    // 设备暂不可达时仅告警，由轮询任务按退避策略继续重连
    if let Err(err) = setup::validate_device(&connection).await {
        warn!(target: "ems.bridge", error = %err, "device_unreachable_at_startup");
    }

    let poller_task = tokio::spawn(poller.run(shutdown.clone()));
    let scheduler_task = if config.send_to_pvoutput {
        let uploader = Arc::new(PvoutputUploader::with_cancellation(
            setup::pvoutput_config(&config),
            shutdown.child_token(),
        )?);
        info!(target: "ems.bridge", endpoint = uploader.endpoint(), "pvoutput_upload_enabled");
        let scheduler =
            UploadScheduler::new(setup::scheduler_config(&config), aggregator.clone(), uploader);
        let cancel = shutdown.clone();
        Some(tokio::spawn(async move { scheduler.run(cancel).await }))
    } else {
        info!(target: "ems.bridge", "pvoutput_upload_disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!(target: "ems.bridge", "shutdown_requested");
    shutdown.cancel();

    poller_task.await?;
    if let Some(task) = scheduler_task {
        task.await?;
    }
    // 所有句柄释放后聚合任务自然退出
    drop(aggregator);
    aggregator_task.await?;

    let summary = metrics().snapshot();
    info!(
        target: "ems.bridge",
        polls_succeeded = summary.polls_succeeded,
        polls_failed = summary.polls_failed,
        reconnects = summary.reconnects,
        uploads_succeeded = summary.uploads_succeeded,
        uploads_rejected = summary.uploads_rejected,
        uploads_transient = summary.uploads_transient,
        ticks_skipped = summary.ticks_skipped,
        "shutdown_complete"
    );
    Ok(())
}
