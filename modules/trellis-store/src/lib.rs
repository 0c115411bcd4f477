pub mod checkpoint;
pub mod logstore;
pub mod memory;
pub mod object;
pub mod replay;
pub mod staging;

pub use checkpoint::{
    cluster_key, embed_key, indexer_key, insight_key, merge, normalize_for_read, sanitize_key,
    CheckpointEngine,
};
pub use logstore::LogStore;
pub use memory::MemoryStagingProvider;
pub use object::{minio_object_store, ObjectStagingProvider};
pub use replay::StageReplay;
pub use staging::{
    PutBatchResult, StagingProvider, StagingRegistry, StagingRequest, DEFAULT_MEMORY_CAP_BYTES,
    MEMORY_PROVIDER_ID, OBJECT_PROVIDER_ID,
};
