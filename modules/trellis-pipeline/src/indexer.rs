//! Indexer: replay a staged run (or a live batch), normalize each record
//! through its vector profile, dedup by content hash, embed the remainder
//! in one batch, and upsert into the vector store.
//!
//! Content hashes are saved only after a successful upsert, so a crashed
//! run re-embeds rather than losing entries.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_common::{
    content_hash, slugify, BatchRef, Checkpoint, KbOp, KvStore, RecordEnvelope, Scope, StageRef,
    TextEmbedder, TrellisError, VectorEntry, VectorStore, META_CONTENT_HASH, META_EMBED_MODEL,
};
use trellis_endpoint::Registries;
use trellis_store::{embed_key, indexer_key, CheckpointEngine, LogStore, StageReplay, StagingRegistry};

use crate::events::KbEventLog;
use crate::profile;

pub enum IndexSource {
    /// Preferred: replay a staged run.
    Staged {
        stage_ref: StageRef,
        batch_refs: Vec<BatchRef>,
    },
    /// Legacy: envelopes materialized from a live endpoint read.
    Live { envelopes: Vec<RecordEnvelope> },
}

pub struct IndexRequest {
    pub profile_id: Option<String>,
    pub dataset_id: String,
    pub artifact_id: String,
    pub run_id: String,
    pub source: IndexSource,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStats {
    pub records_seen: u64,
    pub entries_indexed: u64,
    pub embeddings_requested: u64,
    pub skipped_unchanged: u64,
    pub skipped_missing: u64,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "seen={} indexed={} embedded={} skipped={} missing={}",
            self.records_seen,
            self.entries_indexed,
            self.embeddings_requested,
            self.skipped_unchanged,
            self.skipped_missing
        )
    }
}

struct Candidate {
    node_id: String,
    profile_id: String,
    entity_kind: String,
    source_family: String,
    content_text: String,
    hash: String,
    kv_key: String,
    display_name: String,
    url: Option<String>,
}

pub struct Indexer {
    kv: Arc<dyn KvStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn TextEmbedder>,
    staging: Arc<StagingRegistry>,
    registries: Arc<Registries>,
    checkpoints: Arc<CheckpointEngine>,
    log: Option<LogStore>,
    scope: Scope,
}

impl Indexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<dyn KvStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn TextEmbedder>,
        staging: Arc<StagingRegistry>,
        registries: Arc<Registries>,
        checkpoints: Arc<CheckpointEngine>,
        log: Option<LogStore>,
        scope: Scope,
    ) -> Self {
        Self {
            kv,
            vectors,
            embedder,
            staging,
            registries,
            checkpoints,
            log,
            scope,
        }
    }

    pub async fn index_run(
        &self,
        req: IndexRequest,
        cancel: &CancellationToken,
    ) -> Result<IndexStats, TrellisError> {
        let mut stats = IndexStats::default();
        let mut events = KbEventLog::new("kb", &req.run_id);

        let cdm_model = self
            .registries
            .cdm
            .mapping_for(&req.dataset_id)
            .map(|m| m.model_id);

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut key_profile: Option<String> = None;
        let mut last_position: Option<(BatchRef, u64)> = None;
        let mut last_live_key: Option<String> = None;

        match &req.source {
            IndexSource::Staged {
                stage_ref,
                batch_refs,
            } => {
                let provider = self.staging.get(&stage_ref.provider_id).ok_or_else(|| {
                    TrellisError::StagingUnavailable {
                        message: format!("staging provider not registered: {}", stage_ref.provider_id),
                        retryable: false,
                    }
                })?;
                let mut replay =
                    StageReplay::new(provider, stage_ref.clone(), batch_refs.clone());
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let envelope = replay
                        .next()
                        .await
                        .map_err(|e| TrellisError::Data(format!("stage replay failed: {e}")))?;
                    let Some(envelope) = envelope else { break };
                    stats.records_seen += 1;
                    self.collect_candidate(
                        &envelope,
                        req.profile_id.as_deref(),
                        cdm_model.as_deref(),
                        &mut candidates,
                        &mut key_profile,
                        &mut stats,
                    )
                    .await?;
                    last_position = replay.position().map(|(b, o)| (b.clone(), o));
                }
            }
            IndexSource::Live { envelopes } => {
                for envelope in envelopes {
                    if cancel.is_cancelled() {
                        break;
                    }
                    stats.records_seen += 1;
                    self.collect_candidate(
                        envelope,
                        req.profile_id.as_deref(),
                        cdm_model.as_deref(),
                        &mut candidates,
                        &mut key_profile,
                        &mut stats,
                    )
                    .await?;
                    last_live_key = envelope.source.external_id.clone();
                }
            }
        }

        // Embed everything that survived dedup in a single batch; a
        // failure here fails the slice non-retryably.
        if !candidates.is_empty() {
            let texts: Vec<String> = candidates.iter().map(|c| c.content_text.clone()).collect();
            stats.embeddings_requested = texts.len() as u64;
            let embeddings = self
                .embedder
                .embed_batch(texts)
                .await
                .map_err(|e| TrellisError::Embedding(e.to_string()))?;
            if embeddings.len() != candidates.len() {
                return Err(TrellisError::Embedding(format!(
                    "provider returned {} embeddings for {} inputs",
                    embeddings.len(),
                    candidates.len()
                )));
            }

            let now = Utc::now();
            let entries: Vec<VectorEntry> = candidates
                .iter()
                .zip(embeddings)
                .map(|(candidate, embedding)| {
                    let mut metadata = BTreeMap::new();
                    metadata.insert(META_CONTENT_HASH.to_string(), candidate.hash.clone());
                    metadata.insert(
                        META_EMBED_MODEL.to_string(),
                        self.embedder.model_name().to_string(),
                    );
                    metadata.insert("displayName".to_string(), candidate.display_name.clone());
                    if let Some(url) = &candidate.url {
                        metadata.insert("url".to_string(), url.clone());
                    }
                    VectorEntry {
                        tenant_id: self.scope.tenant_id.clone(),
                        project_id: self.scope.project_id.clone(),
                        profile_id: candidate.profile_id.clone(),
                        node_id: candidate.node_id.clone(),
                        source_family: candidate.source_family.clone(),
                        artifact_id: req.artifact_id.clone(),
                        run_id: req.run_id.clone(),
                        entity_kind: candidate.entity_kind.clone(),
                        content_text: candidate.content_text.clone(),
                        embedding,
                        metadata,
                        updated_at: now,
                    }
                })
                .collect();

            self.vectors
                .upsert_entries(&entries)
                .await
                .map_err(TrellisError::Anyhow)?;
            stats.entries_indexed = entries.len() as u64;

            // Hashes are only persisted after the upsert landed.
            for candidate in &candidates {
                let value = serde_json::json!({ META_CONTENT_HASH: candidate.hash });
                if let Err(e) = self.kv.put(&self.scope, &candidate.kv_key, value, None).await {
                    warn!(key = %candidate.kv_key, error = %e, "Failed to save content hash");
                }
            }

            for entry in &entries {
                events.record(KbOp::UpsertNode, "vector", &entry.node_id, &entry.metadata[META_CONTENT_HASH]);
            }
        } else {
            debug!(skipped = stats.skipped_unchanged, "No embedding work this run");
        }

        // Derive and persist the indexer checkpoint.
        let profile_for_key = key_profile
            .or_else(|| req.profile_id.clone())
            .unwrap_or_else(|| profile::GENERIC_PROFILE.to_string());
        let checkpoint_key = indexer_key(&profile_for_key, &slugify(&req.dataset_id));

        let mut update = Checkpoint {
            last_run_at: Some(Utc::now()),
            last_run_id: Some(req.run_id.clone()),
            record_count: Some(stats.records_seen),
            ..Default::default()
        };
        match &req.source {
            IndexSource::Staged { .. } => {
                if let Some((batch_ref, offset)) = last_position {
                    update.extra.insert(
                        "batchRef".to_string(),
                        serde_json::json!(batch_ref.to_string()),
                    );
                    update
                        .extra
                        .insert("recordOffset".to_string(), serde_json::json!(offset));
                }
            }
            IndexSource::Live { .. } => {
                if let Some(key) = last_live_key {
                    update.extra.insert("cursor".to_string(), serde_json::json!(key));
                }
                update
                    .extra
                    .insert("runId".to_string(), serde_json::json!(req.run_id));
            }
        }
        self.checkpoints
            .save(&self.scope, &checkpoint_key, &update)
            .await
            .map_err(TrellisError::Anyhow)?;

        if let Some(log) = &self.log {
            events.flush(log).await;
            events
                .snapshot(
                    log,
                    &serde_json::json!({
                        "recordsSeen": stats.records_seen,
                        "entriesIndexed": stats.entries_indexed,
                        "skippedUnchanged": stats.skipped_unchanged,
                        "skippedMissing": stats.skipped_missing,
                    }),
                )
                .await;
        }

        info!(run_id = %req.run_id, dataset_id = %req.dataset_id, %stats, "Indexing complete");
        Ok(stats)
    }

    async fn collect_candidate(
        &self,
        envelope: &RecordEnvelope,
        requested_profile: Option<&str>,
        cdm_model: Option<&str>,
        candidates: &mut Vec<Candidate>,
        key_profile: &mut Option<String>,
        stats: &mut IndexStats,
    ) -> Result<(), TrellisError> {
        let profile_id = profile::resolve_profile_id(
            requested_profile,
            cdm_model,
            &envelope.source.source_family,
        );
        if key_profile.is_none() {
            *key_profile = Some(profile_id.clone());
        }

        // Prefer the pre-normalized vector payload; fall back to the
        // profile's legacy normalizer over the staged payload.
        let vector_payload = match &envelope.vector_payload {
            Some(vp) => Some(vp.clone()),
            None => profile::legacy_normalize(&profile_id, &envelope.payload),
        };
        let Some(vector_payload) = vector_payload else {
            stats.skipped_missing += 1;
            return Ok(());
        };

        let required = profile::required_fields(&profile_id);
        let missing = required.iter().any(|field| {
            vector_payload
                .get(*field)
                .and_then(|v| v.as_str())
                .map(str::is_empty)
                .unwrap_or(true)
        });
        if missing {
            stats.skipped_missing += 1;
            return Ok(());
        }

        let Some(node_id) = envelope.source.external_id.clone() else {
            warn!("Envelope without external id, skipping");
            stats.skipped_missing += 1;
            return Ok(());
        };

        let content_text = profile::content_text(&vector_payload);
        let hash = content_hash(&content_text);
        let kv_key = embed_key(&profile_id, &node_id);

        // Skip-on-unchanged: a stored matching hash short-circuits the
        // embedding call entirely.
        let stored = self
            .kv
            .get(&self.scope, &kv_key)
            .await
            .map_err(TrellisError::Anyhow)?;
        if let Some(stored) = stored {
            let stored_hash = stored
                .value
                .get(META_CONTENT_HASH)
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if stored_hash == hash {
                stats.skipped_unchanged += 1;
                return Ok(());
            }
        }

        let display_name = profile::display_name(&envelope.payload, &node_id);
        candidates.push(Candidate {
            node_id,
            profile_id,
            entity_kind: envelope.entity_kind.clone(),
            source_family: envelope.source.source_family.clone(),
            content_text,
            hash,
            kv_key,
            display_name,
            url: envelope.source.url.clone(),
        });
        Ok(())
    }
}
