pub mod batch;
pub mod committer;
pub mod handle;

pub use batch::CommitBatch;
pub use committer::{BatchAccumulator, CommitSummary, Committer, CommitterSettings, RevocationFlush};
pub use handle::{CommitHandle, CommittableRecord};
