//! # 上报能力模块
//!
//! - **payload**：聚合快照 → PVOutput `addstatus` 字段
//! - **pvoutput**：HTTP 上传、响应分类、瞬时失败有限重试
//! - **scheduler**：按墙钟边界（如每 5 分钟的 :00/:05/:10）触发上传，
//!   同一时刻最多一个上传在途，忙时跳过而不排队

mod payload;
mod pvoutput;
mod retry;
mod scheduler;

pub use payload::build_payload;
pub use pvoutput::{PvoutputConfig, PvoutputUploader, StatusUploader, UploadError};
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerConfig, TickOutcome, UploadScheduler, next_boundary_delay};
