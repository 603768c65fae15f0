pub mod archive_id;
pub mod chain_id;
pub mod error;
pub mod job_id;

pub use archive_id::ArchiveId;
pub use chain_id::ChainId;
pub use job_id::JobId;
