pub mod batch;
pub mod queue;

pub use batch::{
    BatchEnvelope, DEFAULT_CHUNK_SIZE, FullSnapshot, PROTOCOL_VERSION, UploadBatch, partition,
};
pub use queue::{DEFAULT_QUEUE_WAIT, QueueStats, UploadQueue};
