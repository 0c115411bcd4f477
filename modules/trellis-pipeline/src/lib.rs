pub mod cluster;
pub mod driver;
pub mod events;
pub mod indexer;
pub mod insight;
pub mod operation;
pub mod planner;
pub mod profile;
pub mod registry;
pub mod runner;
pub mod signal;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use cluster::{ClusterBuilder, ClusterRequest, ClusterStats};
pub use driver::{OperationRequest, PipelineDriver};
pub use events::KbEventLog;
pub use indexer::{IndexRequest, IndexSource, IndexStats, Indexer};
pub use insight::{InsightExtractor, InsightStats};
pub use operation::{OperationManager, OperationSnapshot};
pub use planner::{plan, PlanRequest};
pub use registry::{ArtifactRegistry, RunSummary, SummaryDiff};
pub use runner::{IngestionResult, RunSliceRequest, SliceRunner};
pub use signal::{SignalEngine, SignalStats};
