//! # 指标聚合能力模块
//!
//! 将轮询快照合并为可上传的聚合快照：
//! - 发电功率滚动平均（上传后重置）
//! - 当日累计发电量（计数器复位与跨日处理）
//! - 上传时计算的归一化发电量与效率
//!
//! 滚动状态只由 [`AggregatorHandle`] 背后的所有者任务持有。

mod actor;
mod aggregator;

pub use actor::AggregatorHandle;
pub use aggregator::Aggregator;

/// Pipeline 处理错误。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("aggregator task stopped")]
    Closed,
}
