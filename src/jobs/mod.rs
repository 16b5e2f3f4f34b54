pub mod id;
pub mod registry;
pub mod status;
pub mod storage;

pub use id::JobId;
pub use registry::{JobRegistry, JobGuard};
pub use status::{JobStage, JobStatus};
pub use storage::{Job, JobStorage, StorageStats};
