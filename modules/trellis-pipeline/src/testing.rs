//! Test doubles for the pipeline's trait boundaries:
//!
//! - MemoryKv (KvStore): versioned map with CAS semantics
//! - MemoryVectorStore (VectorStore): filterable in-memory entries
//! - MemorySignalStore (SignalStore): stateful definitions + instances
//! - RecordingGraph (GraphSink): appends every upsert for assertions
//! - FixedEmbedder (TextEmbedder): deterministic vectors + call counters
//! - ScriptedEndpoint (Endpoint/SourceCapable): canned record streams
//! - ScriptedChat (ChatModel): canned LLM replies
//!
//! Plus envelope/record builders shared by the scenario tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use llm_client::ChatModel;
use trellis_common::{
    Checkpoint, GraphSink, KgEdge, KgNode, KvStore, PlanStrategy, PutOutcome, Record,
    RecordEnvelope, RecordKind, RecordSource, Scope, SignalDefinition, SignalInstance,
    SignalStatus, SignalStore, Slice, TextEmbedder, VectorEntry, VectorFilter, VectorStore,
    VersionedValue,
};
use trellis_endpoint::{
    Capability, Endpoint, EndpointDescriptor, ReadRequest, RecordReader, SliceCapable,
    SourceCapable, ValidationReport, VectorProfileProvider,
};

/// Standard embedding dimension for test vectors.
pub const TEST_EMBEDDING_DIM: usize = 8;

// ---------------------------------------------------------------------------
// MemoryKv
// ---------------------------------------------------------------------------

/// Versioned in-memory KV with CAS. Keys are scoped like the real store.
#[derive(Default)]
pub struct MemoryKv {
    data: Mutex<HashMap<String, (serde_json::Value, u64)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(scope: &Scope, key: &str) -> String {
        format!("{}/{}/{key}", scope.tenant_id, scope.project_id)
    }

    /// Raw value lookup for assertions.
    pub fn value(&self, scope: &Scope, key: &str) -> Option<serde_json::Value> {
        let data = self.data.lock().unwrap();
        data.get(&Self::full_key(scope, key)).map(|(v, _)| v.clone())
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, scope: &Scope, key: &str) -> Result<Option<VersionedValue>> {
        let data = self.data.lock().unwrap();
        Ok(data.get(&Self::full_key(scope, key)).map(|(value, version)| VersionedValue {
            value: value.clone(),
            version: *version,
        }))
    }

    async fn put(
        &self,
        scope: &Scope,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<PutOutcome> {
        let mut data = self.data.lock().unwrap();
        let full_key = Self::full_key(scope, key);
        let current = data.get(&full_key).map(|(_, v)| *v);
        match (expected_version, current) {
            (Some(expected), Some(actual)) if expected != actual => Ok(PutOutcome::Conflict {
                current_version: actual,
            }),
            (Some(_), None) => Ok(PutOutcome::Conflict { current_version: 0 }),
            _ => {
                let next = current.unwrap_or(0) + 1;
                data.insert(full_key, (value, next));
                Ok(PutOutcome::Stored { version: next })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryVectorStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryVectorStore {
    entries: Mutex<HashMap<String, VectorEntry>>,
    upserted: AtomicU64,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries ever upserted (not deduplicated).
    pub fn upserted_count(&self) -> u64 {
        self.upserted.load(Ordering::Relaxed)
    }

    pub fn entry(&self, node_id: &str) -> Option<VectorEntry> {
        self.entries.lock().unwrap().get(node_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed an entry directly, bypassing the upsert counter.
    pub fn seed(&self, entry: VectorEntry) {
        self.entries.lock().unwrap().insert(entry.node_id.clone(), entry);
    }
}

#[async_trait::async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert_entries(&self, entries: &[VectorEntry]) -> Result<()> {
        let mut map = self.entries.lock().unwrap();
        for entry in entries {
            map.insert(entry.node_id.clone(), entry.clone());
        }
        self.upserted.fetch_add(entries.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn list_entries(&self, filter: &VectorFilter) -> Result<Vec<VectorEntry>> {
        let map = self.entries.lock().unwrap();
        let mut entries: Vec<VectorEntry> = map
            .values()
            .filter(|e| e.tenant_id == filter.tenant_id && e.project_id == filter.project_id)
            .filter(|e| {
                filter.profile_ids.is_empty() || filter.profile_ids.contains(&e.profile_id)
            })
            .filter(|e| {
                filter
                    .source_family
                    .as_deref()
                    .map(|f| e.source_family == f)
                    .unwrap_or(true)
            })
            .filter(|e| {
                filter
                    .artifact_id
                    .as_deref()
                    .map(|a| e.artifact_id == a)
                    .unwrap_or(true)
            })
            .filter(|e| {
                filter
                    .since_updated_at
                    .map(|since| e.updated_at >= since)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        if filter.limit > 0 {
            entries.truncate(filter.limit as usize);
        }
        Ok(entries)
    }

    async fn delete_by_artifact(
        &self,
        tenant_id: &str,
        artifact_id: &str,
        run_id: &str,
    ) -> Result<u64> {
        let mut map = self.entries.lock().unwrap();
        let before = map.len();
        map.retain(|_, e| {
            !(e.tenant_id == tenant_id && e.artifact_id == artifact_id && e.run_id == run_id)
        });
        Ok((before - map.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// MemorySignalStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySignalStore {
    definitions: Mutex<HashMap<String, SignalDefinition>>,
    instances: Mutex<HashMap<(String, String), SignalInstance>>,
    status_updates: Mutex<Vec<(String, String, SignalStatus)>>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance(&self, definition_id: &str, entity_ref: &str) -> Option<SignalInstance> {
        self.instances
            .lock()
            .unwrap()
            .get(&(definition_id.to_string(), entity_ref.to_string()))
            .cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Every `update_instance_status` call in order, for asserting that
    /// instances never flap through transient states.
    pub fn status_updates(&self) -> Vec<(String, String, SignalStatus)> {
        self.status_updates.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SignalStore for MemorySignalStore {
    async fn upsert_definition(&self, def: &SignalDefinition) -> Result<()> {
        self.definitions
            .lock()
            .unwrap()
            .insert(def.id.clone(), def.clone());
        Ok(())
    }

    async fn list_definitions(&self, source_family: &str) -> Result<Vec<SignalDefinition>> {
        let definitions = self.definitions.lock().unwrap();
        let mut matching: Vec<SignalDefinition> = definitions
            .values()
            .filter(|d| d.source_family == source_family)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matching)
    }

    async fn list_instances(&self, definition_id: &str) -> Result<Vec<SignalInstance>> {
        let instances = self.instances.lock().unwrap();
        let mut matching: Vec<SignalInstance> = instances
            .values()
            .filter(|i| i.definition_id == definition_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.entity_ref.cmp(&b.entity_ref));
        Ok(matching)
    }

    async fn upsert_instance(&self, instance: &SignalInstance) -> Result<()> {
        self.instances.lock().unwrap().insert(
            (instance.definition_id.clone(), instance.entity_ref.clone()),
            instance.clone(),
        );
        Ok(())
    }

    async fn update_instance_status(
        &self,
        definition_id: &str,
        entity_ref: &str,
        status: SignalStatus,
    ) -> Result<()> {
        let mut instances = self.instances.lock().unwrap();
        let key = (definition_id.to_string(), entity_ref.to_string());
        match instances.get_mut(&key) {
            Some(instance) => {
                instance.status = status;
                self.status_updates.lock().unwrap().push((
                    key.0,
                    key.1,
                    status,
                ));
                Ok(())
            }
            None => Err(anyhow!("unknown instance {definition_id}/{entity_ref}")),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingGraph
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingGraph {
    nodes: Mutex<Vec<KgNode>>,
    edges: Mutex<Vec<KgEdge>>,
}

impl RecordingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> Vec<KgNode> {
        self.nodes.lock().unwrap().clone()
    }

    pub fn edges(&self) -> Vec<KgEdge> {
        self.edges.lock().unwrap().clone()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.lock().unwrap().iter().map(|n| n.id.clone()).collect()
    }

    pub fn edges_of_type(&self, edge_type: &str) -> Vec<KgEdge> {
        self.edges
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.edge_type == edge_type)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl GraphSink for RecordingGraph {
    async fn upsert_node(&self, node: &KgNode) -> Result<()> {
        self.nodes.lock().unwrap().push(node.clone());
        Ok(())
    }

    async fn upsert_edge(&self, edge: &KgEdge) -> Result<()> {
        self.edges.lock().unwrap().push(edge.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FixedEmbedder
// ---------------------------------------------------------------------------

/// Deterministic embedder. Registered texts get exact vectors; everything
/// else gets a unique hash-based vector with low similarity to the rest.
/// Counts batch calls and embedded texts for dedup assertions.
pub struct FixedEmbedder {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    dimension: usize,
    batch_calls: AtomicU64,
    embedded: AtomicU64,
}

impl FixedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            vectors: Mutex::new(HashMap::new()),
            dimension,
            batch_calls: AtomicU64::new(0),
            embedded: AtomicU64::new(0),
        }
    }

    /// Register a text→vector mapping for controlled similarity.
    pub fn on_text(self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.lock().unwrap().insert(text.to_string(), vector);
        self
    }

    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::Relaxed)
    }

    pub fn embedded_count(&self) -> u64 {
        self.embedded.load(Ordering::Relaxed)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(vector) = self.vectors.lock().unwrap().get(text) {
            return vector.clone();
        }
        // Stable fallback: hash the text into one hot-ish dimension.
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let hash = hasher.finish();
        let mut vector = vec![0.0f32; self.dimension];
        vector[(hash % self.dimension as u64) as usize] = 1.0;
        vector
    }
}

#[async_trait::async_trait]
impl TextEmbedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        self.embedded.fetch_add(1, Ordering::Relaxed);
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        self.embedded.fetch_add(texts.len() as u64, Ordering::Relaxed);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_name(&self) -> &str {
        "fixed-test"
    }

    fn dim(&self) -> usize {
        self.dimension
    }
}

// ---------------------------------------------------------------------------
// ScriptedEndpoint
// ---------------------------------------------------------------------------

/// Source endpoint yielding a canned record list, with an optional
/// trailing checkpoint, an optional vector-profile projection, and an
/// optional set of canned slices (making it slice-capable).
#[derive(Debug)]
pub struct ScriptedEndpoint {
    id: String,
    family: String,
    records: Vec<Record>,
    slices: Vec<(Slice, Vec<Record>)>,
    trailing_checkpoint: Option<Checkpoint>,
    capabilities: Vec<Capability>,
    vector_profile: bool,
    validation: ValidationReport,
}

impl ScriptedEndpoint {
    pub fn new(id: &str, family: &str, records: Vec<Record>) -> Self {
        Self {
            id: id.to_string(),
            family: family.to_string(),
            records,
            slices: Vec::new(),
            trailing_checkpoint: None,
            capabilities: vec![Capability::Source],
            vector_profile: false,
            validation: ValidationReport::ok(),
        }
    }

    pub fn with_trailing_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.trailing_checkpoint = Some(checkpoint);
        self
    }

    pub fn with_vector_profile(mut self) -> Self {
        self.vector_profile = true;
        self.capabilities.push(Capability::VectorProfile);
        self
    }

    pub fn with_validation(mut self, validation: ValidationReport) -> Self {
        self.validation = validation;
        self
    }

    /// Make the endpoint slice-capable: each entry is one planned slice
    /// with its own record list.
    pub fn with_slices(mut self, slices: Vec<(Slice, Vec<Record>)>) -> Self {
        self.capabilities.push(Capability::Slice);
        self.slices = slices;
        self
    }
}

struct ScriptedReader {
    records: std::vec::IntoIter<Record>,
    trailing_checkpoint: Option<Checkpoint>,
}

#[async_trait::async_trait]
impl RecordReader for ScriptedReader {
    async fn next(&mut self) -> Result<Option<Record>> {
        Ok(self.records.next())
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        self.trailing_checkpoint.clone()
    }
}

#[async_trait::async_trait]
impl Endpoint for ScriptedEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_family(&self) -> &str {
        &self.family
    }

    async fn validate(&self) -> Result<ValidationReport> {
        Ok(self.validation.clone())
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn descriptor(&self) -> EndpointDescriptor {
        EndpointDescriptor {
            template_id: self.id.clone(),
            display_name: format!("Scripted {}", self.family),
            fields: vec![],
        }
    }

    fn as_source(&self) -> Option<&dyn SourceCapable> {
        Some(self)
    }

    fn as_slice(&self) -> Option<&dyn SliceCapable> {
        if self.slices.is_empty() {
            None
        } else {
            Some(self)
        }
    }

    fn as_vector_profile(&self) -> Option<&dyn VectorProfileProvider> {
        if self.vector_profile {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl SourceCapable for ScriptedEndpoint {
    async fn read(&self, _req: &ReadRequest) -> Result<Box<dyn RecordReader>> {
        Ok(Box::new(ScriptedReader {
            records: self.records.clone().into_iter(),
            trailing_checkpoint: self.trailing_checkpoint.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl SliceCapable for ScriptedEndpoint {
    async fn plan_slices(
        &self,
        _dataset_id: &str,
        _strategy: PlanStrategy,
        _checkpoint: &Checkpoint,
        _target_slice_size: u64,
    ) -> Result<Vec<Slice>> {
        Ok(self.slices.iter().map(|(slice, _)| slice.clone()).collect())
    }

    async fn read_slice(
        &self,
        slice: &Slice,
        _checkpoint: &Checkpoint,
        _filter: Option<&Record>,
    ) -> Result<Box<dyn RecordReader>> {
        let records = self
            .slices
            .iter()
            .find(|(s, _)| s.slice_id == slice.slice_id)
            .map(|(_, records)| records.clone())
            .unwrap_or_default();
        Ok(Box::new(ScriptedReader {
            records: records.into_iter(),
            trailing_checkpoint: self.trailing_checkpoint.clone(),
        }))
    }
}

impl VectorProfileProvider for ScriptedEndpoint {
    fn normalize_for_index(&self, _entity_kind: &str, payload: &Record) -> Result<Option<Record>> {
        Ok(crate::profile::legacy_normalize("test", payload))
    }
}

// ---------------------------------------------------------------------------
// ScriptedChat
// ---------------------------------------------------------------------------

/// Chat model returning a fixed reply (or an error when none is set).
pub struct ScriptedChat {
    reply: Option<String>,
    calls: AtomicU64,
}

impl ScriptedChat {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl ChatModel for ScriptedChat {
    async fn chat_completion(&self, _system: &str, _user: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => Err(anyhow!("scripted chat failure")),
        }
    }

    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-test"
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn record(json: serde_json::Value) -> Record {
    serde_json::from_value(json).expect("test record must be an object")
}

pub fn envelope(family: &str, entity_kind: &str, payload: serde_json::Value) -> RecordEnvelope {
    envelope_at(family, entity_kind, payload, Utc::now())
}

pub fn envelope_at(
    family: &str,
    entity_kind: &str,
    payload: serde_json::Value,
    observed_at: DateTime<Utc>,
) -> RecordEnvelope {
    let payload = record(payload);
    let external_id = payload
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    RecordEnvelope {
        record_kind: RecordKind::Raw,
        entity_kind: entity_kind.to_string(),
        source: RecordSource {
            endpoint_id: "ep-test".to_string(),
            source_family: family.to_string(),
            source_id: format!("{family}:dataset"),
            url: None,
            external_id,
        },
        tenant_id: "dev".to_string(),
        project_key: "global".to_string(),
        payload,
        vector_payload: None,
        observed_at,
    }
}

pub fn test_scope() -> Scope {
    Scope::new("dev", "global")
}
