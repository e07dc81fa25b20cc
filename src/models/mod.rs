pub mod config;
pub mod job;
pub mod options;
pub mod preview;
pub mod progress;

pub use config::DaemonConfig;
pub use job::{is_remote, validate_new_job, Job, JobStatus, LifecycleOp, NewJob};
pub use options::{OperationType, RcloneOptions, RsyncOptions, TransferSpec};
pub use preview::PendingPreview;
pub use progress::Progress;
