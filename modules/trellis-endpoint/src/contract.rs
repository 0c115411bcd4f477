//! The endpoint contract: every connector satisfies the base `Endpoint`
//! trait; everything beyond identity and validation is a capability probed
//! at runtime. Polymorphism is by capability composition, not inheritance:
//! callers check `capabilities()` and use the matching accessor.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use trellis_common::{Checkpoint, PlanStrategy, Record, RecordEnvelope, RunMode, Slice};

// --- Capabilities ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Source,
    Sink,
    Action,
    Metadata,
    Incremental,
    Slice,
    Staging,
    Adaptive,
    VectorProfile,
    MultiRecordVectorProfile,
    MentionExtractor,
    RelationExtractor,
    EntityMapper,
    EntityResolver,
    RelationEventProcessor,
}

// --- Validation and descriptors ---

/// Result of validating an endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_version: Option<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: String::new(),
            detected_version: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
            detected_version: None,
        }
    }
}

/// One configuration field in an endpoint descriptor, for UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub name: String,
    pub label: String,
    pub required: bool,
    #[serde(default)]
    pub secret: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDescriptor {
    pub template_id: String,
    pub display_name: String,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

// --- Reading ---

/// Parameters for a plain (non-sliced) read.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub dataset_id: String,
    pub checkpoint: Checkpoint,
    pub mode: RunMode,
    pub filter: Option<Record>,
    pub params: Record,
}

/// Pull-based record iterator. `next` is a suspension point; records come
/// back in source order. After the iterator is drained, `checkpoint()`
/// exposes the trailing cursor when the source tracks one.
#[async_trait::async_trait]
pub trait RecordReader: Send {
    async fn next(&mut self) -> Result<Option<Record>>;

    fn checkpoint(&self) -> Option<Checkpoint> {
        None
    }
}

// --- Base contract ---

/// Base contract satisfied by every connector.
#[async_trait::async_trait]
pub trait Endpoint: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    /// Vendor category ("github", "jira", "confluence", "jdbc", ...).
    fn source_family(&self) -> &str;

    /// Validate the configuration against the live system.
    async fn validate(&self) -> Result<ValidationReport>;

    fn capabilities(&self) -> &[Capability];

    fn descriptor(&self) -> EndpointDescriptor;

    /// Release connections and buffers. Idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    // Capability accessors. An endpoint advertising a capability in
    // `capabilities()` must return Some from the matching accessor.

    fn as_source(&self) -> Option<&dyn SourceCapable> {
        None
    }
    fn as_sink(&self) -> Option<&dyn SinkCapable> {
        None
    }
    fn as_action(&self) -> Option<&dyn ActionCapable> {
        None
    }
    fn as_metadata(&self) -> Option<&dyn MetadataCapable> {
        None
    }
    fn as_incremental(&self) -> Option<&dyn IncrementalCapable> {
        None
    }
    fn as_slice(&self) -> Option<&dyn SliceCapable> {
        None
    }
    fn as_staging(&self) -> Option<&dyn StagingCapable> {
        None
    }
    fn as_adaptive(&self) -> Option<&dyn AdaptiveCapable> {
        None
    }
    fn as_vector_profile(&self) -> Option<&dyn VectorProfileProvider> {
        None
    }
    fn as_multi_record_vector_profile(&self) -> Option<&dyn MultiRecordVectorProfileProvider> {
        None
    }
}

// --- Capability traits ---

#[async_trait::async_trait]
pub trait SourceCapable: Send + Sync {
    async fn read(&self, req: &ReadRequest) -> Result<Box<dyn RecordReader>>;
}

#[async_trait::async_trait]
pub trait SinkCapable: Send + Sync {
    /// Write envelopes to the downstream system. Returns the written count.
    async fn write(&self, envelopes: &[RecordEnvelope]) -> Result<u64>;
}

#[async_trait::async_trait]
pub trait ActionCapable: Send + Sync {
    async fn invoke(&self, action: &str, params: &Record) -> Result<serde_json::Value>;
}

#[async_trait::async_trait]
pub trait MetadataCapable: Send + Sync {
    async fn get_schema(&self, dataset_id: &str) -> Result<Option<serde_json::Value>>;
    async fn list_datasets(&self) -> Result<Vec<String>>;
}

/// Marker capability: the endpoint honors checkpoint watermarks on read.
pub trait IncrementalCapable: Send + Sync {
    /// The record field carrying the watermark for a dataset, when fixed.
    fn watermark_field(&self, dataset_id: &str) -> Option<String>;
}

#[async_trait::async_trait]
pub trait SliceCapable: Send + Sync {
    /// Produce bounded slices for a dataset under a strategy. Slice ids must
    /// be stable across replans for the same (dataset, strategy, bounds).
    async fn plan_slices(
        &self,
        dataset_id: &str,
        strategy: PlanStrategy,
        checkpoint: &Checkpoint,
        target_slice_size: u64,
    ) -> Result<Vec<Slice>>;

    async fn read_slice(
        &self,
        slice: &Slice,
        checkpoint: &Checkpoint,
        filter: Option<&Record>,
    ) -> Result<Box<dyn RecordReader>>;
}

/// The endpoint has a preference about where its records are staged.
pub trait StagingCapable: Send + Sync {
    fn preferred_staging_provider(&self) -> Option<String>;
}

/// Row/byte estimates and candidate slice keys from an adaptive probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionProbe {
    pub estimated_rows: u64,
    pub estimated_bytes: u64,
    #[serde(default)]
    pub slice_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Record::is_empty")]
    pub statistics: Record,
}

#[async_trait::async_trait]
pub trait AdaptiveCapable: Send + Sync {
    async fn probe_ingestion(&self, dataset_id: &str) -> Result<IngestionProbe>;

    async fn plan_ingestion(
        &self,
        dataset_id: &str,
        probe: &IngestionProbe,
        target_slice_size: u64,
    ) -> Result<Vec<Slice>>;
}

/// Projects a record payload into the shape indexed by a vector profile.
pub trait VectorProfileProvider: Send + Sync {
    /// `Ok(None)` means the record has no vector projection and is skipped.
    fn normalize_for_index(&self, entity_kind: &str, payload: &Record) -> Result<Option<Record>>;
}

/// Vector normalization over a group of records (e.g. a thread collapsed
/// into one indexable document).
pub trait MultiRecordVectorProfileProvider: Send + Sync {
    fn normalize_group(&self, entity_kind: &str, payloads: &[Record]) -> Result<Option<Record>>;
}

// --- Discovery traits ---

pub trait MentionExtractor: Send + Sync {
    fn extract_mentions(&self, payload: &Record) -> Vec<String>;
}

/// Extracted relation: (from_ref, relation, to_ref).
pub trait RelationExtractor: Send + Sync {
    fn extract_relations(&self, payload: &Record) -> Vec<(String, String, String)>;
}

pub trait EntityMapper: Send + Sync {
    fn map_entity(&self, entity_kind: &str, payload: &Record) -> Option<Record>;
}

pub trait EntityResolver: Send + Sync {
    /// Resolve an external reference to a canonical entity id.
    fn resolve(&self, entity_ref: &str) -> Option<String>;
}

pub trait RelationEventProcessor: Send + Sync {
    fn process(&self, event: &Record) -> Vec<Record>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Capability::VectorProfile).unwrap(),
            "\"vector_profile\""
        );
        assert_eq!(
            serde_json::to_string(&Capability::MultiRecordVectorProfile).unwrap(),
            "\"multi_record_vector_profile\""
        );
    }

    #[test]
    fn validation_report_helpers() {
        assert!(ValidationReport::ok().valid);
        let bad = ValidationReport::invalid("auth token rejected");
        assert!(!bad.valid);
        assert_eq!(bad.message, "auth token rejected");
    }
}
