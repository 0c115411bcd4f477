mod service;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llm_client::{chat_model_from_config, embedder_from_config};
use trellis_common::Config;
use trellis_endpoint::Registries;
use trellis_pipeline::driver::{PipelineDeps, PipelineDriver};
use trellis_pipeline::insight::skill::SkillRegistry;
use trellis_pipeline::{ArtifactRegistry, OperationManager};
use trellis_rpc::pb::operation_service_server::OperationServiceServer;
use trellis_rpc::{GrpcGraphSink, GrpcKvStore, GrpcSignalStore, GrpcVectorStore};
use trellis_store::{
    minio_object_store, CheckpointEngine, LogStore, MemoryStagingProvider, ObjectStagingProvider,
    StagingRegistry, DEFAULT_MEMORY_CAP_BYTES,
};

use service::OperationApi;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let bind_addr = std::env::var("OPERATION_GRPC_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
        .parse()
        .context("parsing OPERATION_GRPC_ADDR")?;

    // External collaborators. Connection errors are sticky: the process
    // fails fast rather than limping without its stores.
    let kv = Arc::new(GrpcKvStore::connect(&config.kv_addr).await?);
    let vectors = Arc::new(GrpcVectorStore::connect(&config.vector_addr).await?);
    let signals = Arc::new(GrpcSignalStore::connect(&config.signal_addr).await?);
    let graph = Arc::new(GrpcGraphSink::connect(&config.kg_addr).await?);

    // Staging: memory always; the object store when MinIO is configured.
    // The log store shares the MinIO bucket.
    let staging = Arc::new(StagingRegistry::new());
    staging.register(Arc::new(MemoryStagingProvider::new(DEFAULT_MEMORY_CAP_BYTES)));
    let mut log = None;
    if let Some(store) = minio_object_store(&config)? {
        staging.register(Arc::new(ObjectStagingProvider::new(
            Arc::clone(&store),
            config.minio_stage_prefix.clone(),
        )));
        log = Some(LogStore::new(store));
        info!("Object staging provider registered");
    }

    let checkpoints = Arc::new(CheckpointEngine::new(kv.clone() as Arc<_>, log.clone()));

    // Skills: built-ins, then the optional override directory.
    let skills = Arc::new(SkillRegistry::with_builtins()?);
    if let Some(dir) = &config.insight_skill_dir {
        let loaded = skills.load_dir(std::path::Path::new(dir))?;
        info!(dir = %dir, loaded, "Loaded insight skills from directory");
    }

    let artifacts = match &config.registry_db_url {
        Some(url) => Some(ArtifactRegistry::connect(url).await?),
        None => None,
    };

    let embedder = embedder_from_config(&config);
    let chat = chat_model_from_config(&config);

    // Connector factories register here at deployment build time; the
    // core ships with the registries empty.
    let registries = Arc::new(Registries::new());

    let driver = Arc::new(PipelineDriver::new(PipelineDeps {
        registries,
        staging,
        kv: kv as Arc<_>,
        vectors: vectors as Arc<_>,
        signals: signals as Arc<_>,
        graph: graph as Arc<_>,
        embedder,
        chat,
        skills,
        checkpoints,
        log,
        artifacts,
        manager: Arc::new(OperationManager::new()),
        config,
    }));

    let shutdown = CancellationToken::new();
    let api = OperationApi::new(driver, shutdown.clone());

    info!(%bind_addr, "Operation service listening");
    Server::builder()
        .add_service(OperationServiceServer::new(api))
        .serve_with_shutdown(bind_addr, async {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            info!("Shutdown requested, cancelling running operations");
        })
        .await?;

    Ok(())
}
