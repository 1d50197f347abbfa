pub mod router;
pub mod worker;

pub use router::PartitionRouter;
pub use worker::{PartitionWorker, WorkerContext};
