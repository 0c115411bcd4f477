use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An open-ended record as produced by a source endpoint.
/// Field values may be strings, numbers, booleans, nested maps or arrays.
pub type Record = serde_json::Map<String, serde_json::Value>;

// --- Record Envelopes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Raw,
    Cdm,
    Vector,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Raw => write!(f, "raw"),
            RecordKind::Cdm => write!(f, "cdm"),
            RecordKind::Vector => write!(f, "vector"),
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "cdm" => Ok(Self::Cdm),
            "vector" => Ok(Self::Vector),
            other => Err(format!("unknown RecordKind: {other}")),
        }
    }
}

/// Provenance of a staged record: which endpoint produced it and where
/// the upstream object lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSource {
    pub endpoint_id: String,
    /// Vendor category of the endpoint (e.g. "github", "jira", "jdbc").
    pub source_family: String,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// The sealed wrapper around a payload carrying source and tenant metadata.
/// Immutable once written to a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEnvelope {
    pub record_kind: RecordKind,
    pub entity_kind: String,
    pub source: RecordSource,
    pub tenant_id: String,
    pub project_key: String,
    pub payload: Record,
    /// Pre-normalized payload for vector indexing, when the endpoint
    /// provides a vector profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_payload: Option<Record>,
    pub observed_at: DateTime<Utc>,
}

// --- Stage and Batch References ---

/// Opaque handle to a stage: `<providerId>:<stageId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageRef {
    pub provider_id: String,
    pub stage_id: String,
}

impl StageRef {
    pub fn new(provider_id: impl Into<String>, stage_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            stage_id: stage_id.into(),
        }
    }

    /// Parse `<providerId>:<stageId>`. The stage id may itself contain colons.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        match s.split_once(':') {
            Some((provider, stage)) if !provider.is_empty() && !stage.is_empty() => {
                Ok(Self::new(provider, stage))
            }
            _ => Err(format!("malformed stage ref: {s}")),
        }
    }
}

impl std::fmt::Display for StageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider_id, self.stage_id)
    }
}

impl TryFrom<String> for StageRef {
    type Error = String;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<StageRef> for String {
    fn from(r: StageRef) -> Self {
        r.to_string()
    }
}

/// Address of one batch within a stage, keyed by `(sliceId, batchSeq)`.
/// The rendered form `<sliceId>/<zero-padded seq>` sorts lexicographically
/// in write order within a slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BatchRef {
    pub slice_id: String,
    pub batch_seq: u32,
}

impl BatchRef {
    pub fn new(slice_id: impl Into<String>, batch_seq: u32) -> Self {
        Self {
            slice_id: slice_id.into(),
            batch_seq,
        }
    }

    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let (slice, seq) = s
            .rsplit_once('/')
            .ok_or_else(|| format!("malformed batch ref: {s}"))?;
        let batch_seq: u32 = seq
            .parse()
            .map_err(|_| format!("malformed batch seq in ref: {s}"))?;
        if slice.is_empty() {
            return Err(format!("malformed batch ref: {s}"));
        }
        Ok(Self::new(slice, batch_seq))
    }
}

impl std::fmt::Display for BatchRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:08}", self.slice_id, self.batch_seq)
    }
}

impl TryFrom<String> for BatchRef {
    type Error = String;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<BatchRef> for String {
    fn from(r: BatchRef) -> Self {
        r.to_string()
    }
}

// --- Checkpoints ---

/// A checkpoint cursor: either a scalar watermark, a legacy nested map
/// (possibly many levels of `cursor` keys deep), or an opaque
/// provider-specific value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Scalar(String),
    Legacy(Record),
    Opaque(serde_json::Value),
}

impl Cursor {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Cursor::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_legacy(&self) -> Option<&Record> {
        match self {
            Cursor::Legacy(m) => Some(m),
            _ => None,
        }
    }

    /// True when the cursor is a map, the legacy shape that must never
    /// be written back after normalization.
    pub fn is_map(&self) -> bool {
        matches!(self, Cursor::Legacy(_))
    }
}

/// The durable cursor for one `(profileId, datasetId)` pair.
///
/// Reserved keys are typed; anything else a connector stashed on the
/// checkpoint rides along in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_mode: Option<String>,
    #[serde(flatten)]
    pub extra: Record,
}

impl Checkpoint {
    pub fn is_empty(&self) -> bool {
        self.watermark.is_none()
            && self.cursor.is_none()
            && self.last_run_at.is_none()
            && self.last_run_id.is_none()
            && self.record_count.is_none()
            && self.data_mode.is_none()
            && self.extra.is_empty()
    }

    /// The effective watermark, if one is present and non-empty.
    pub fn effective_watermark(&self) -> Option<&str> {
        self.watermark.as_deref().filter(|w| !w.is_empty())
    }
}

// --- Slices and Plans ---

/// One bounded, resumable unit of ingestion.
/// `slice_id` is stable across replans for the same (dataset, strategy, bounds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    pub slice_id: String,
    /// Zero-based, dense within a plan.
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<String>,
    #[serde(default, skip_serializing_if = "Record::is_empty")]
    pub params: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<u64>,
}

impl Slice {
    /// The single full-dataset slice used when an endpoint cannot slice.
    pub fn full() -> Self {
        Self {
            slice_id: "full".to_string(),
            sequence: 0,
            lower: None,
            upper: None,
            params: Record::new(),
            estimated_rows: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    Full,
    Incremental,
    Adaptive,
}

impl std::fmt::Display for PlanStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStrategy::Full => write!(f, "full"),
            PlanStrategy::Incremental => write!(f, "incremental"),
            PlanStrategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for PlanStrategy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(format!("unknown PlanStrategy: {other}")),
        }
    }
}

/// A planned ingestion run: bounded slices covering the dataset under the
/// declared strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionPlan {
    pub dataset_id: String,
    pub template_id: String,
    pub strategy: PlanStrategy,
    pub slices: Vec<Slice>,
    pub slice_count: u32,
    pub target_slice_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdm_model_id: Option<String>,
}

// --- Run and Data Modes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Incremental,
    Preview,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Full => write!(f, "full"),
            RunMode::Incremental => write!(f, "incremental"),
            RunMode::Preview => write!(f, "preview"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "preview" => Ok(Self::Preview),
            other => Err(format!("unknown RunMode: {other}")),
        }
    }
}

/// How the run treats pre-existing state. `Reset` and `Full` discard the
/// incoming checkpoint before reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    #[default]
    #[serde(rename = "")]
    Default,
    Raw,
    Full,
    Reset,
}

impl DataMode {
    pub fn discards_checkpoint(&self) -> bool {
        matches!(self, DataMode::Reset | DataMode::Full)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataMode::Default => "",
            DataMode::Raw => "raw",
            DataMode::Full => "full",
            DataMode::Reset => "reset",
        }
    }
}

impl std::str::FromStr for DataMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::Default),
            "raw" => Ok(Self::Raw),
            "full" => Ok(Self::Full),
            "reset" => Ok(Self::Reset),
            other => Err(format!("unknown DataMode: {other}")),
        }
    }
}

// --- Vector Entries ---

/// A single entry in the vector store. `node_id` is globally unique per
/// tenant; the embedding length must match the configured dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorEntry {
    pub tenant_id: String,
    pub project_id: String,
    pub profile_id: String,
    pub node_id: String,
    pub source_family: String,
    pub artifact_id: String,
    pub run_id: String,
    pub entity_kind: String,
    pub content_text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata key carrying the SHA-256 of `content_text`, used for
/// skip-on-unchanged embedding dedup.
pub const META_CONTENT_HASH: &str = "contentHash";

/// Metadata key carrying the embedding model name.
pub const META_EMBED_MODEL: &str = "embedModel";

// --- Clusters ---

/// A related cluster reference with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedCluster {
    pub cluster_id: String,
    pub score: f32,
}

/// A derived cluster of vector entries. `cluster_id` is deterministic:
/// a digest of the sorted member node ids scoped by dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub cluster_id: String,
    pub member_ids: Vec<String>,
    pub centroid: Vec<f32>,
    pub size: u32,
    pub avg_sim: f32,
    pub max_sim: f32,
    pub edge_degree: u32,
    /// Changes iff membership changes.
    pub member_hash: String,
    /// Up to 5 related clusters, sorted by score.
    #[serde(default)]
    pub top_related: Vec<RelatedCluster>,
}

// --- Signals ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for SignalSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalSeverity::Info => write!(f, "info"),
            SignalSeverity::Warning => write!(f, "warning"),
            SignalSeverity::Error => write!(f, "error"),
            SignalSeverity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for SignalSeverity {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown SignalSeverity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImplMode {
    #[serde(rename = "CODE")]
    Code,
    #[serde(rename = "DSL")]
    Dsl,
}

/// A signal rule: CODE-mode rules are evaluated by registered matchers,
/// DSL-mode rules carry a typed `definition_spec` (see the signal engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDefinition {
    pub id: String,
    pub slug: String,
    pub source_family: String,
    pub entity_kind: String,
    pub severity: SignalSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub impl_mode: ImplMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_spec: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "RESOLVED")]
    Resolved,
    #[serde(rename = "SUPPRESSED")]
    Suppressed,
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalStatus::Open => write!(f, "OPEN"),
            SignalStatus::Resolved => write!(f, "RESOLVED"),
            SignalStatus::Suppressed => write!(f, "SUPPRESSED"),
        }
    }
}

/// An emitted occurrence of a signal definition against one entity.
/// Keyed uniquely by `(definition_id, entity_ref)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalInstance {
    pub definition_id: String,
    pub entity_ref: String,
    pub entity_kind: String,
    pub severity: SignalSeverity,
    pub status: SignalStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Record::is_empty")]
    pub details: Record,
    pub source_run_id: String,
}

// --- Insights ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightSummary {
    pub text: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sentiment {
    pub label: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub tones: Vec<String>,
}

impl Default for Sentiment {
    fn default() -> Self {
        Self {
            label: "neutral".to_string(),
            score: 0.0,
            tones: Vec::new(),
        }
    }
}

/// An LLM-generated structured summary attached to an entity.
/// Insights with an empty `summary.text` are invalid and dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub provider: String,
    pub prompt_id: String,
    pub entity_ref: String,
    pub generated_at: DateTime<Utc>,
    pub summary: InsightSummary,
    #[serde(default)]
    pub sentiment: Sentiment,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub escalation_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
    #[serde(default)]
    pub waiting_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Record::is_empty")]
    pub metadata: Record,
    #[serde(default)]
    pub tags: Vec<String>,
}

// --- Knowledge Graph ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KgNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KgEdge {
    pub id: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub from_id: String,
    pub to_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

// --- KB Events ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KbOp {
    UpsertNode,
    UpsertEdge,
    Delete,
}

impl std::fmt::Display for KbOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KbOp::UpsertNode => write!(f, "upsert_node"),
            KbOp::UpsertEdge => write!(f, "upsert_edge"),
            KbOp::Delete => write!(f, "delete"),
        }
    }
}

/// An append-only audit record of a node/edge upsert. Sequence numbers are
/// per-run monotonic; `hash` enables idempotent replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbEvent {
    pub seq: u64,
    pub run_id: String,
    pub op: KbOp,
    pub kind: String,
    pub id: String,
    pub hash: String,
    pub at: DateTime<Utc>,
}

// --- Operations ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Queued => write!(f, "QUEUED"),
            OperationStatus::Running => write!(f, "RUNNING"),
            OperationStatus::Succeeded => write!(f, "SUCCEEDED"),
            OperationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Progress counters for one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub slices_total: u32,
    pub slices_done: u32,
    pub records_staged: u64,
    pub bytes_staged: u64,
    pub records_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_ref: Option<StageRef>,
    pub batches: u32,
}
