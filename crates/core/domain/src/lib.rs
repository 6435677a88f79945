//! 领域模型：设备寄存器画像、采集快照与上传记录。
//!
//! 各能力模块（protocol / pipeline / upload）只通过这里的类型交换数据，
//! 不直接依赖彼此的内部结构。

pub mod data;
pub mod profile;

pub use data::{AggregatedSnapshot, Snapshot, StatusPayload, UploadOutcome, UploadRecord};
pub use profile::{
    DataType, DerivedDefinition, DeviceProfile, ProfileCatalog, ProfileError, PvoutputField,
    RegisterDefinition, WordOrder,
};
