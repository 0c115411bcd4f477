//! Wire layer for the pipeline's external collaborators: the KV, vector,
//! signal and knowledge-graph services, plus the operation surface this
//! system exposes.
//!
//! The `.proto` sources live in `proto/`; the prost/tonic output is checked
//! in under `src/gen/` and regenerated manually with tonic-build when the
//! contract changes, so the build itself needs no protoc.

pub mod clients;

/// Generated protobuf/tonic types for `trellis.v1`.
pub mod pb {
    #![allow(clippy::all)]
    include!("gen/trellis.v1.rs");
}

pub use clients::{GrpcGraphSink, GrpcKvStore, GrpcSignalStore, GrpcVectorStore};
