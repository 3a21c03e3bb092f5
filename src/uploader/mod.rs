// 上传引擎模块
//
// - chunk: 分片规划
// - part: 分片状态
// - scheduler: 并发分片调度
// - engine: 单次 / 分片上传流程
// - backend: direct 与 legacy 两种远端协议

pub mod backend;
pub mod checksum;
pub mod chunk;
pub mod element;
pub mod engine;
pub mod part;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    backend_for, CreateTransferRequest, DirectBackend, LegacyBackend, PartRequest,
    PartUploadTarget, SingleShotRequest, UploadBackend,
};
pub use checksum::{md5_bytes, md5_file};
pub use chunk::{
    ChunkLimits, ChunkPlanner, ChunkSpec, TransferMode, UploadPlan, DEFAULT_CHUNK_SIZE,
    MAX_CHUNK_SIZE, MAX_PARTS, MIN_CHUNK_SIZE, SERVICE_MAX_CHUNK_SIZE,
};
pub use element::DestinationKey;
pub use engine::{DatasetUploader, UploadOptions};
pub use part::{PartOutcome, PartStatus, UploadPart};
pub use scheduler::{PartScheduler, ScheduleReport};
