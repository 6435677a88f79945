//! 聚合器所有者任务
//!
//! 轮询任务与上传调度共享同一份滚动状态，两者通过消息通道串行访问，
//! 最近一次聚合结果另经 `watch` 通道发布给订阅方。

use crate::aggregator::Aggregator;
use crate::PipelineError;
use domain::{AggregatedSnapshot, Snapshot};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

const COMMAND_BUFFER: usize = 32;

enum Command {
    Ingest {
        snapshot: Snapshot,
        reply: oneshot::Sender<AggregatedSnapshot>,
    },
    TakeForUpload {
        reply: oneshot::Sender<Option<AggregatedSnapshot>>,
    },
}

/// 聚合器句柄（可克隆，所有副本释放后所有者任务退出）。
#[derive(Clone)]
pub struct AggregatorHandle {
    commands: mpsc::Sender<Command>,
    latest: watch::Receiver<Option<AggregatedSnapshot>>,
}

impl AggregatorHandle {
    /// 在当前运行时上启动所有者任务。
    pub fn spawn(aggregator: Aggregator) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let (publisher, latest) = watch::channel(None);
        let task = tokio::spawn(run(aggregator, receiver, publisher));
        (Self { commands, latest }, task)
    }

    /// 合并一次轮询快照，返回聚合结果。
    pub async fn ingest(&self, snapshot: Snapshot) -> Result<AggregatedSnapshot, PipelineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Ingest { snapshot, reply })
            .await
            .map_err(|_| PipelineError::Closed)?;
        response.await.map_err(|_| PipelineError::Closed)
    }

    /// 取出上传用快照并重置滚动窗口。
    pub async fn take_for_upload(&self) -> Result<Option<AggregatedSnapshot>, PipelineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::TakeForUpload { reply })
            .await
            .map_err(|_| PipelineError::Closed)?;
        response.await.map_err(|_| PipelineError::Closed)
    }

    /// 最近一次聚合结果。
    pub fn latest(&self) -> Option<AggregatedSnapshot> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AggregatedSnapshot>> {
        self.latest.clone()
    }
}

async fn run(
    mut aggregator: Aggregator,
    mut commands: mpsc::Receiver<Command>,
    publisher: watch::Sender<Option<AggregatedSnapshot>>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Ingest { snapshot, reply } => {
                let aggregated = aggregator.ingest(snapshot);
                publisher.send_replace(Some(aggregated.clone()));
                let _ = reply.send(aggregated);
            }
            Command::TakeForUpload { reply } => {
                let _ = reply.send(aggregator.take_for_upload());
            }
        }
    }
    debug!(target: "ems.pipeline", "aggregator_task_stopped");
}
