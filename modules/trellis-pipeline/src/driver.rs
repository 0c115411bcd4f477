//! Pipeline driver: executes one operation end to end: plan, then per
//! slice ingest → index → cluster → signal → insight, each stage reading
//! the previous stage's staged output. The operation manager tracks state;
//! the artifact registry is updated best-effort along the way.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use llm_client::ChatModel;
use trellis_common::{
    sha1_hex, slugify, Checkpoint, Config, DataMode, GraphSink, KvStore, PlanStrategy, Record,
    RunMode, Scope, SignalStore, TextEmbedder, TrellisError, VectorStore,
};
use trellis_endpoint::{classify_validation, Registries};
use trellis_store::{indexer_key, CheckpointEngine, LogStore, StageReplay, StagingRegistry};

use crate::cluster::{ClusterBuilder, ClusterRequest, ClusterThresholds};
use crate::events::KbEventLog;
use crate::indexer::{IndexRequest, IndexSource, Indexer};
use crate::insight::skill::SkillRegistry;
use crate::insight::InsightExtractor;
use crate::operation::{classify_error, OperationManager};
use crate::planner::{self, PlanRequest};
use crate::profile;
use crate::registry::ArtifactRegistry;
use crate::runner::{RunSliceRequest, SliceRunner};
use crate::signal::SignalEngine;

/// The wire-level start request, with string parameters as carried by the
/// operation API.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub kind: String,
    pub template_id: String,
    pub endpoint_id: String,
    pub parameters: std::collections::HashMap<String, String>,
    pub idempotency_key: String,
}

impl OperationRequest {
    fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn dataset_id(&self) -> String {
        self.param("datasetId")
            .unwrap_or(&self.endpoint_id)
            .to_string()
    }

    fn endpoint_config(&self) -> Record {
        // The raw config rides as a JSON blob; everything else is a
        // string parameter.
        if let Some(raw) = self.param("endpointConfig") {
            if let Ok(Value::Object(map)) = serde_json::from_str(raw) {
                return map;
            }
        }
        self.parameters
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect()
    }

    fn policy(&self) -> Record {
        match self.param("policy").and_then(|raw| serde_json::from_str(raw).ok()) {
            Some(Value::Object(map)) => map,
            _ => Record::new(),
        }
    }
}

/// Everything the driver wires together.
pub struct PipelineDeps {
    pub registries: Arc<Registries>,
    pub staging: Arc<StagingRegistry>,
    pub kv: Arc<dyn KvStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub signals: Arc<dyn SignalStore>,
    pub graph: Arc<dyn GraphSink>,
    pub embedder: Arc<dyn TextEmbedder>,
    pub chat: Option<Arc<dyn ChatModel>>,
    pub skills: Arc<SkillRegistry>,
    pub checkpoints: Arc<CheckpointEngine>,
    pub log: Option<LogStore>,
    pub artifacts: Option<ArtifactRegistry>,
    pub manager: Arc<OperationManager>,
    pub config: Config,
}

pub struct PipelineDriver {
    deps: PipelineDeps,
    scope: Scope,
}

impl PipelineDriver {
    pub fn new(deps: PipelineDeps) -> Self {
        let scope = Scope::new(&deps.config.tenant_id, &deps.config.default_project);
        Self { deps, scope }
    }

    pub fn manager(&self) -> Arc<OperationManager> {
        Arc::clone(&self.deps.manager)
    }

    /// Run one started operation to completion, updating its state.
    pub async fn execute(
        &self,
        operation_id: &str,
        req: OperationRequest,
        cancel: CancellationToken,
    ) {
        self.deps.manager.mark_running(operation_id);
        match self.run(operation_id, &req, &cancel).await {
            Ok(()) => self.deps.manager.succeed(operation_id),
            Err(e) => {
                let detail = classify_error(&e);
                warn!(
                    operation_id,
                    code = %detail.code,
                    error = %detail.message,
                    "Operation failed"
                );
                if let Some(artifacts) = &self.deps.artifacts {
                    artifacts
                        .mark_index_failed(&artifact_id(&req), &detail.message)
                        .await;
                }
                self.deps.manager.fail(operation_id, detail);
            }
        }
    }

    async fn run(
        &self,
        operation_id: &str,
        req: &OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<(), TrellisError> {
        let dataset_id = req.dataset_id();
        let artifact = artifact_id(req);
        let run_id = operation_id.to_string();
        let endpoint_config = req.endpoint_config();
        let policy = req.policy();

        // Validate configuration before any work happens.
        let endpoint = self
            .deps
            .registries
            .endpoints
            .open(&req.template_id, &endpoint_config)?;
        let report = endpoint
            .validate()
            .await
            .map_err(|e| TrellisError::EndpointUnreachable(e.to_string()))?;
        if !report.valid {
            return Err(classify_validation(&req.template_id, &report));
        }
        let source_family = endpoint.source_family().to_string();

        // Resolve the shared (profile, dataset) checkpoint.
        let cdm_model = self
            .deps
            .registries
            .cdm
            .mapping_for(&dataset_id)
            .map(|m| m.model_id);
        let profile_id = profile::resolve_profile_id(
            req.param("profileId"),
            cdm_model.as_deref(),
            &source_family,
        );
        let checkpoint_key = indexer_key(&profile_id, &slugify(&dataset_id));
        let checkpoint = self
            .deps
            .checkpoints
            .load(&self.scope, &checkpoint_key)
            .await
            .map_err(TrellisError::Anyhow)?
            .unwrap_or_default();

        let strategy = req
            .param("strategy")
            .map(PlanStrategy::from_str)
            .transpose()
            .map_err(TrellisError::Config)?
            .unwrap_or(PlanStrategy::Full);
        let mode = req
            .param("mode")
            .map(RunMode::from_str)
            .transpose()
            .map_err(TrellisError::Config)?
            .unwrap_or(RunMode::Full);
        let data_mode = req
            .param("dataMode")
            .map(DataMode::from_str)
            .transpose()
            .map_err(TrellisError::Config)?
            .unwrap_or_default();

        let plan = planner::plan(
            endpoint.as_ref(),
            &self.deps.registries.cdm,
            &PlanRequest {
                template_id: req.template_id.clone(),
                dataset_id: dataset_id.clone(),
                strategy,
                checkpoint: checkpoint.clone(),
                policy: policy.clone(),
            },
        )
        .await
        .map_err(TrellisError::Anyhow)?;

        self.deps.manager.update_stats(operation_id, |stats| {
            stats.slices_total = plan.slice_count;
        });
        if let Some(artifacts) = &self.deps.artifacts {
            artifacts.mark_indexing(&artifact).await;
        }

        let runner = SliceRunner::new(
            Arc::clone(&self.deps.registries),
            Arc::clone(&self.deps.staging),
            &self.deps.config,
        );
        let indexer = Indexer::new(
            Arc::clone(&self.deps.kv),
            Arc::clone(&self.deps.vectors),
            Arc::clone(&self.deps.embedder),
            Arc::clone(&self.deps.staging),
            Arc::clone(&self.deps.registries),
            Arc::clone(&self.deps.checkpoints),
            self.deps.log.clone(),
            self.scope.clone(),
        );
        let clusters = ClusterBuilder::new(
            Arc::clone(&self.deps.kv),
            Arc::clone(&self.deps.vectors),
            Arc::clone(&self.deps.graph),
            Arc::clone(&self.deps.checkpoints),
            self.deps.log.clone(),
            self.scope.clone(),
            ClusterThresholds::from_config(&self.deps.config),
        );
        let signal_engine = SignalEngine::new(
            Arc::clone(&self.deps.signals),
            Arc::clone(&self.deps.graph),
        );
        let insights = InsightExtractor::new(
            Arc::clone(&self.deps.kv),
            Arc::clone(&self.deps.graph),
            self.deps.chat.clone(),
            Arc::clone(&self.deps.skills),
            Arc::clone(&self.deps.registries),
            self.scope.clone(),
        );

        let mut total_entries = 0u64;
        let mut total_clusters = 0u64;
        let mut total_cache_hits = 0u64;
        let mut last_stage_ref = None;
        let mut events = KbEventLog::new("kb", &run_id);

        // One signal session spans the whole operation: reconciliation
        // must observe every slice of the run before resolving anything.
        // Preview runs never touch signal state.
        let mut signal_session = if mode == RunMode::Preview {
            None
        } else {
            Some(signal_engine.session(&source_family, &run_id).await?)
        };

        for slice in &plan.slices {
            if cancel.is_cancelled() {
                return Err(TrellisError::Timeout("operation cancelled".to_string()));
            }

            let unit_id = format!("{run_id}:{}", slice.sequence);
            let result = runner
                .run_slice(
                    RunSliceRequest {
                        template_id: req.template_id.clone(),
                        endpoint_id: req.endpoint_id.clone(),
                        dataset_id: dataset_id.clone(),
                        unit_id,
                        mode,
                        data_mode,
                        policy: policy.clone(),
                        checkpoint: checkpoint.clone(),
                        slice: Some(slice.clone()),
                        staging_provider_id: req.param("stagingProviderId").map(str::to_string),
                        filter: None,
                        transient_state: None,
                        endpoint_config: endpoint_config.clone(),
                    },
                    cancel,
                )
                .await;

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    // A failed slice only records the run id for
                    // debugging; the stored cursor stays put.
                    let debug_cp = Checkpoint {
                        last_run_id: Some(run_id.clone()),
                        ..Default::default()
                    };
                    if let Err(save_err) = self
                        .deps
                        .checkpoints
                        .save(&self.scope, &checkpoint_key, &debug_cp)
                        .await
                    {
                        warn!(error = %save_err, "Failed to record run id on failed slice");
                    }
                    return Err(e);
                }
            };

            self.deps.manager.update_stats(operation_id, |stats| {
                stats.records_staged += result.records_staged;
                stats.bytes_staged += result.bytes_staged;
                stats.batches += result.batch_refs.len() as u32;
                stats.staging_provider_id = result.staging_provider_id.clone();
                stats.stage_ref = result.stage_ref.clone();
            });

            // Preview runs stop at ingestion and leave the stored
            // checkpoint untouched; a dry run must not advance the
            // watermark a later real run resumes from.
            if mode == RunMode::Preview {
                self.deps.manager.note_slice_committed(operation_id);
                continue;
            }

            self.deps
                .checkpoints
                .save(&self.scope, &checkpoint_key, &result.new_checkpoint)
                .await
                .map_err(TrellisError::Anyhow)?;

            let Some(stage_ref) = result.stage_ref.clone() else {
                self.deps.manager.note_slice_committed(operation_id);
                continue;
            };
            last_stage_ref = Some(stage_ref.clone());

            // Index.
            let index_stats = indexer
                .index_run(
                    IndexRequest {
                        profile_id: Some(profile_id.clone()),
                        dataset_id: dataset_id.clone(),
                        artifact_id: artifact.clone(),
                        run_id: run_id.clone(),
                        source: IndexSource::Staged {
                            stage_ref: stage_ref.clone(),
                            batch_refs: result.batch_refs.clone(),
                        },
                    },
                    cancel,
                )
                .await?;
            total_entries += index_stats.entries_indexed;
            self.deps.manager.update_stats(operation_id, |stats| {
                stats.records_written += index_stats.entries_indexed;
            });

            // Cluster.
            let cluster_stats = clusters
                .run(
                    ClusterRequest {
                        dataset_id: dataset_id.clone(),
                        source_family: Some(source_family.clone()),
                        artifact_id: Some(artifact.clone()),
                        run_id: run_id.clone(),
                    },
                    cancel,
                )
                .await?;
            total_clusters += u64::from(cluster_stats.clusters);
            total_cache_hits += u64::from(cluster_stats.cache_hits);

            // Signals: observe this slice's records; reconciliation waits
            // until every slice of the run has been seen.
            let provider = self.deps.staging.get(&stage_ref.provider_id).ok_or_else(|| {
                TrellisError::StagingUnavailable {
                    message: format!("staging provider vanished: {}", stage_ref.provider_id),
                    retryable: true,
                }
            })?;
            if let Some(session) = signal_session.as_mut() {
                let mut replay = StageReplay::new(
                    Arc::clone(&provider),
                    stage_ref.clone(),
                    result.batch_refs.clone(),
                );
                while let Some(envelope) = replay
                    .next()
                    .await
                    .map_err(|e| TrellisError::Data(e.to_string()))?
                {
                    session.observe(&envelope, &mut events).await?;
                }
            }

            // Insights.
            let mut replay = StageReplay::new(provider, stage_ref, result.batch_refs.clone());
            while let Some(envelope) = replay
                .next()
                .await
                .map_err(|e| TrellisError::Data(e.to_string()))?
            {
                insights.process(&envelope, &mut events).await?;
            }

            self.deps.manager.note_slice_committed(operation_id);
        }

        // All slices observed; previously-OPEN instances that no longer
        // match anywhere in the run resolve now.
        if let Some(session) = signal_session {
            session.reconcile(&mut events).await?;
        }

        if let Some(log) = &self.deps.log {
            events.flush(log).await;
        }

        // Registry wrap-up, best-effort.
        if let Some(artifacts) = &self.deps.artifacts {
            let snapshot = self.deps.manager.get(operation_id);
            let records_staged = snapshot.map(|s| s.stats.records_staged).unwrap_or(0);
            let version_hash = sha1_hex(&format!(
                "{}|{records_staged}|{total_entries}",
                last_stage_ref
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_default()
            ));
            let mut counters = serde_json::json!({
                "recordsStaged": records_staged,
                "entriesIndexed": total_entries,
                "versionHash": version_hash,
            });
            if let Some(path) = events.last_events_path() {
                counters["logEventsPath"] = serde_json::json!(path);
            }
            artifacts.mark_indexed(&artifact, &counters).await;
            artifacts
                .mark_clustered(
                    &artifact,
                    &serde_json::json!({
                        "clusters": total_clusters,
                        "cacheHits": total_cache_hits,
                    }),
                )
                .await;
        }

        // Retention, best-effort.
        if let Some(log) = &self.deps.log {
            let retention = self.deps.config.logstore_retention_days;
            if let Err(e) = log.prune("kb", retention).await {
                warn!(error = %e, "Log store pruning failed");
            }
            if let Err(e) = self.deps.checkpoints.prune_history(retention).await {
                warn!(error = %e, "Checkpoint history pruning failed");
            }
        }

        info!(
            operation_id,
            dataset_id = %dataset_id,
            entries = total_entries,
            clusters = total_clusters,
            "Operation complete"
        );
        Ok(())
    }
}

fn artifact_id(req: &OperationRequest) -> String {
    req.param("artifactId")
        .map(str::to_string)
        .unwrap_or_else(|| req.dataset_id())
}
