use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::types::{
    KgEdge, KgNode, SignalDefinition, SignalInstance, SignalStatus, VectorEntry,
};

// --- KV store (versioned, CAS) ---

/// Tenant/project scope for keyed lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub tenant_id: String,
    pub project_id: String,
}

impl Scope {
    pub fn new(tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
        }
    }
}

/// A stored value with its CAS version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub value: serde_json::Value,
    pub version: u64,
}

/// Result of a versioned put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { version: u64 },
    /// The expected version no longer matches. Re-read, re-merge, retry.
    Conflict { current_version: u64 },
}

/// Versioned key-value store. Values are JSON-encoded on the wire.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, scope: &Scope, key: &str) -> Result<Option<VersionedValue>>;

    /// Put with optional expected version. `None` writes unconditionally.
    async fn put(
        &self,
        scope: &Scope,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<PutOutcome>;
}

// --- Vector store ---

/// Filter for listing vector entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorFilter {
    pub tenant_id: String,
    pub project_id: String,
    pub profile_ids: Vec<String>,
    pub source_family: Option<String>,
    pub artifact_id: Option<String>,
    pub since_updated_at: Option<DateTime<Utc>>,
    /// 0 means the store default.
    pub limit: u32,
}

#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert_entries(&self, entries: &[VectorEntry]) -> Result<()>;
    async fn list_entries(&self, filter: &VectorFilter) -> Result<Vec<VectorEntry>>;
    async fn delete_by_artifact(
        &self,
        tenant_id: &str,
        artifact_id: &str,
        run_id: &str,
    ) -> Result<u64>;
}

// --- Signal store ---

#[async_trait::async_trait]
pub trait SignalStore: Send + Sync {
    async fn upsert_definition(&self, def: &SignalDefinition) -> Result<()>;
    async fn list_definitions(&self, source_family: &str) -> Result<Vec<SignalDefinition>>;
    async fn list_instances(&self, definition_id: &str) -> Result<Vec<SignalInstance>>;
    async fn upsert_instance(&self, instance: &SignalInstance) -> Result<()>;
    async fn update_instance_status(
        &self,
        definition_id: &str,
        entity_ref: &str,
        status: SignalStatus,
    ) -> Result<()>;
}

// --- Knowledge graph sink ---

#[async_trait::async_trait]
pub trait GraphSink: Send + Sync {
    async fn upsert_node(&self, node: &KgNode) -> Result<()>;
    async fn upsert_edge(&self, edge: &KgEdge) -> Result<()>;
}

// --- Text embedder ---

#[async_trait::async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Model name attached to vector metadata.
    fn model_name(&self) -> &str;

    /// Output dimension. Every produced embedding has this length.
    fn dim(&self) -> usize;
}
