use std::env;

/// Default gRPC address when a service-specific one is not set.
const DEFAULT_GRPC_ADDR: &str = "localhost:9099";

/// Application configuration loaded from environment variables.
/// Library code takes `Config` by value; only the server binary reads the
/// process environment.
#[derive(Debug, Clone)]
pub struct Config {
    // Tenancy
    pub tenant_id: String,
    pub default_project: String,

    // External service addresses (gRPC)
    pub kv_addr: String,
    pub vector_addr: String,
    pub signal_addr: String,
    pub kg_addr: String,

    // LLM / embeddings
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    /// "openai", "local", or empty (zero-vector fallback).
    pub embedding_provider: String,
    pub embedding_model: String,
    pub embed_dim: usize,
    pub insight_provider: String,
    pub insight_model: String,
    pub insight_skill_dir: Option<String>,

    // Pipeline knobs
    /// Preview payload cap in bytes. Larger previews are staged instead.
    pub max_payload_bytes: usize,
    /// Log-store retention in days. <= 0 disables pruning.
    pub logstore_retention_days: i64,
    pub cluster_sim_threshold: f32,
    pub cluster_graph_threshold: f32,
    pub cluster_max_size: usize,

    // MinIO staging
    pub minio_endpoint: Option<String>,
    pub minio_access_key: Option<String>,
    pub minio_secret_key: Option<String>,
    pub minio_bucket: String,
    pub minio_stage_prefix: String,

    // Artifact registry (Postgres)
    pub registry_db_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables, applying documented
    /// defaults for everything that has one.
    pub fn from_env() -> Self {
        Self {
            tenant_id: env_or("TENANT_ID", "dev"),
            default_project: env_or("METADATA_DEFAULT_PROJECT", "global"),
            kv_addr: env_or("KV_GRPC_ADDR", DEFAULT_GRPC_ADDR),
            vector_addr: env_or("VECTOR_GRPC_ADDR", DEFAULT_GRPC_ADDR),
            signal_addr: env_or("SIGNAL_GRPC_ADDR", DEFAULT_GRPC_ADDR),
            kg_addr: env_or("KG_GRPC_ADDR", DEFAULT_GRPC_ADDR),
            openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|v| !v.is_empty()),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").ok().filter(|v| !v.is_empty()),
            embedding_provider: env::var("EMBEDDING_PROVIDER").unwrap_or_default(),
            embedding_model: env_or("EMBEDDING_MODEL", "text-embedding-3-small"),
            embed_dim: parse_env("EMBED_DIM", 1536),
            insight_provider: env::var("INSIGHT_PROVIDER").unwrap_or_default(),
            insight_model: env::var("INSIGHT_MODEL").unwrap_or_default(),
            insight_skill_dir: env::var("INSIGHT_SKILL_DIR").ok().filter(|v| !v.is_empty()),
            max_payload_bytes: parse_env("UCL_MAX_PAYLOAD_BYTES", 1_048_576),
            logstore_retention_days: parse_env("LOGSTORE_RETENTION_DAYS", 30),
            cluster_sim_threshold: parse_env("CLUSTER_SIM_THRESHOLD", 0.35),
            cluster_graph_threshold: parse_env("CLUSTER_GRAPH_THRESHOLD", 0.45),
            cluster_max_size: parse_env("CLUSTER_MAX_SIZE", 5),
            minio_endpoint: env::var("MINIO_ENDPOINT").ok().filter(|v| !v.is_empty()),
            minio_access_key: env::var("MINIO_ACCESS_KEY").ok().filter(|v| !v.is_empty()),
            minio_secret_key: env::var("MINIO_SECRET_KEY").ok().filter(|v| !v.is_empty()),
            minio_bucket: env_or("MINIO_BUCKET", "trellis"),
            minio_stage_prefix: env_or("MINIO_STAGE_PREFIX", "stages"),
            registry_db_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
        }
    }

    /// A config with defaults only, for tests. No environment reads.
    pub fn for_tests() -> Self {
        Self {
            tenant_id: "dev".to_string(),
            default_project: "global".to_string(),
            kv_addr: DEFAULT_GRPC_ADDR.to_string(),
            vector_addr: DEFAULT_GRPC_ADDR.to_string(),
            signal_addr: DEFAULT_GRPC_ADDR.to_string(),
            kg_addr: DEFAULT_GRPC_ADDR.to_string(),
            openai_api_key: None,
            anthropic_api_key: None,
            embedding_provider: String::new(),
            embedding_model: "text-embedding-3-small".to_string(),
            embed_dim: 1536,
            insight_provider: String::new(),
            insight_model: String::new(),
            insight_skill_dir: None,
            max_payload_bytes: 1_048_576,
            logstore_retention_days: 30,
            cluster_sim_threshold: 0.35,
            cluster_graph_threshold: 0.45,
            cluster_max_size: 5,
            minio_endpoint: None,
            minio_access_key: None,
            minio_secret_key: None,
            minio_bucket: "trellis".to_string(),
            minio_stage_prefix: "stages".to_string(),
            registry_db_url: None,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
