//! Ingestion runner: read one slice from an endpoint, normalize records
//! into envelopes, stage them in bounded batches, and hand back a merged
//! checkpoint plus staging refs for the downstream stages.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_common::{
    BatchRef, Checkpoint, Cursor, DataMode, Record, RecordEnvelope, RecordKind, RecordSource,
    RunMode, Slice, StageRef, TrellisError,
};
use trellis_endpoint::{Endpoint, ReadRequest, RecordReader, Registries};
use trellis_store::{
    merge, normalize_for_read, StagingProvider, StagingRegistry, StagingRequest,
};

use crate::profile;

/// Envelopes buffered before each staging flush.
pub const CHUNK_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RunSliceRequest {
    pub template_id: String,
    pub endpoint_id: String,
    pub dataset_id: String,
    /// Work-unit id, also the prefix for synthetic logical ids.
    pub unit_id: String,
    pub mode: RunMode,
    pub data_mode: DataMode,
    pub policy: Record,
    pub checkpoint: Checkpoint,
    pub slice: Option<Slice>,
    pub staging_provider_id: Option<String>,
    pub filter: Option<Record>,
    pub transient_state: Option<Record>,
    pub endpoint_config: Record,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSliceStats {
    pub records_read: u64,
    pub records_staged: u64,
    pub bytes_staged: u64,
    pub batches: u32,
}

impl std::fmt::Display for RunSliceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "read={} staged={} bytes={} batches={}",
            self.records_read, self.records_staged, self.bytes_staged, self.batches
        )
    }
}

#[derive(Debug, Clone)]
pub struct IngestionResult {
    pub new_checkpoint: Checkpoint,
    pub stats: RunSliceStats,
    pub stage_ref: Option<StageRef>,
    pub batch_refs: Vec<BatchRef>,
    pub bytes_staged: u64,
    pub records_staged: u64,
    pub staging_provider_id: Option<String>,
    pub transient_state: Option<Record>,
    /// Preview mode only: inline rows, or the staged summary stub when the
    /// payload exceeded the cap.
    pub preview: Option<Value>,
}

pub struct SliceRunner {
    registries: Arc<Registries>,
    staging: Arc<StagingRegistry>,
    /// Preview payload cap in bytes.
    max_payload_bytes: usize,
    tenant_id: String,
    project_key: String,
}

impl SliceRunner {
    pub fn new(
        registries: Arc<Registries>,
        staging: Arc<StagingRegistry>,
        config: &trellis_common::Config,
    ) -> Self {
        Self {
            registries,
            staging,
            max_payload_bytes: config.max_payload_bytes,
            tenant_id: config.tenant_id.clone(),
            project_key: config.default_project.clone(),
        }
    }

    pub async fn run_slice(
        &self,
        req: RunSliceRequest,
        cancel: &CancellationToken,
    ) -> Result<IngestionResult, TrellisError> {
        // 1-2. Discard the incoming checkpoint on reset/full, then flatten
        // whatever survives.
        let incoming = if req.data_mode.discards_checkpoint() {
            Checkpoint::default()
        } else {
            req.checkpoint.clone()
        };
        let checkpoint = normalize_for_read(&incoming);

        // 3. Open the endpoint and pick the read path.
        let endpoint = self
            .registries
            .endpoints
            .open(&req.template_id, &req.endpoint_config)?;

        let mut reader = self
            .open_reader(endpoint.as_ref(), &req, &checkpoint)
            .await?;

        // 4. Staging selection. Preview stays inline until the payload cap
        // forces a spill.
        let slice_id = req
            .slice
            .as_ref()
            .map(|s| s.slice_id.clone())
            .unwrap_or_else(|| "full".to_string());
        let staging_req = StagingRequest {
            provider_id: req.staging_provider_id.clone(),
            disable_object_store: req
                .policy
                .get("disableObjectStore")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            estimated_bytes: req
                .slice
                .as_ref()
                .and_then(|s| s.estimated_rows)
                .unwrap_or(0)
                .saturating_mul(1024),
        };

        let mut writer: Option<StageWriter> = None;
        let mut preview_buffer: Vec<RecordEnvelope> = Vec::new();
        let mut preview_bytes: usize = 0;
        let mut preview_spilled = false;

        let mut buffer: Vec<RecordEnvelope> = Vec::with_capacity(CHUNK_SIZE.min(1024));
        let mut stats = RunSliceStats::default();

        // 5-6. Iterate, normalize, buffer, flush.
        loop {
            if cancel.is_cancelled() {
                debug!(unit_id = %req.unit_id, "Slice cancelled, flushing buffered envelopes");
                break;
            }
            let record = reader
                .next()
                .await
                .map_err(|e| TrellisError::Data(format!("record iterator failed: {e}")))?;
            let Some(record) = record else {
                break;
            };
            stats.records_read += 1;

            let envelope = self.normalize_envelope(record, &req, endpoint.as_ref());

            if req.mode == RunMode::Preview && !preview_spilled {
                preview_bytes += serde_json::to_vec(&envelope.payload)
                    .map(|v| v.len())
                    .unwrap_or(0);
                preview_buffer.push(envelope);
                if preview_bytes > self.max_payload_bytes {
                    preview_spilled = true;
                    // Everything seen so far must now be staged too.
                    buffer.append(&mut preview_buffer);
                }
            } else {
                buffer.push(envelope);
            }

            if buffer.len() >= CHUNK_SIZE {
                let w = self
                    .writer_for(&mut writer, &staging_req, &slice_id)
                    .await?;
                w.flush(&mut buffer, &mut stats).await?;
            }
        }

        // Preview under the cap never touches staging.
        let staged_anything = !buffer.is_empty() || writer.is_some();
        if staged_anything && (req.mode != RunMode::Preview || preview_spilled) {
            let w = self
                .writer_for(&mut writer, &staging_req, &slice_id)
                .await?;
            w.flush(&mut buffer, &mut stats).await?;
        }

        // 7. Merge the iterator's trailing cursor onto the incoming
        // checkpoint, then apply the legacy safeguard: a cursor that is
        // still a map is dropped rather than persisted.
        let mut new_checkpoint = checkpoint;
        if let Some(iterator_cp) = reader.checkpoint() {
            new_checkpoint = merge(&new_checkpoint, &iterator_cp);
        }
        if matches!(new_checkpoint.cursor, Some(Cursor::Legacy(_))) {
            warn!(unit_id = %req.unit_id, "Dropping legacy map cursor from iterator checkpoint");
            new_checkpoint.cursor = None;
        }
        new_checkpoint.last_run_at = Some(Utc::now());
        new_checkpoint.record_count = Some(stats.records_read);
        new_checkpoint.data_mode = Some(req.data_mode.as_str().to_string());

        // 8-9. Assemble preview payload; finalize durable stages only.
        let (stage_ref, batch_refs, provider_id) = match writer {
            Some(w) => {
                if w.provider.durable() {
                    w.provider.finalize_stage(&w.stage_ref).await.map_err(|e| {
                        TrellisError::StagingUnavailable {
                            message: format!("finalizing stage failed: {e}"),
                            retryable: true,
                        }
                    })?;
                } else {
                    debug!(stage_ref = %w.stage_ref, "Memory stage left open for downstream replay");
                }
                (
                    Some(w.stage_ref),
                    w.batch_refs,
                    Some(w.provider.id().to_string()),
                )
            }
            None => (None, Vec::new(), None),
        };

        let preview = if req.mode == RunMode::Preview {
            if preview_spilled {
                Some(serde_json::json!({
                    "_preview": "staged",
                    "rowCount": stats.records_read,
                    "recordsPath": stage_ref.as_ref().map(|r| r.to_string()).unwrap_or_default(),
                }))
            } else {
                let rows: Vec<Value> = preview_buffer
                    .into_iter()
                    .map(|e| Value::Object(e.payload))
                    .collect();
                Some(preview_value(rows))
            }
        } else {
            None
        };

        if let Err(e) = endpoint.close().await {
            warn!(endpoint_id = %req.endpoint_id, error = %e, "Endpoint close failed");
        }

        info!(
            unit_id = %req.unit_id,
            dataset_id = %req.dataset_id,
            %stats,
            "Slice ingestion complete"
        );

        Ok(IngestionResult {
            new_checkpoint,
            bytes_staged: stats.bytes_staged,
            records_staged: stats.records_staged,
            stats,
            stage_ref,
            batch_refs,
            staging_provider_id: provider_id,
            transient_state: req.transient_state,
            preview,
        })
    }

    async fn open_reader(
        &self,
        endpoint: &dyn Endpoint,
        req: &RunSliceRequest,
        checkpoint: &Checkpoint,
    ) -> Result<Box<dyn RecordReader>, TrellisError> {
        if let (Some(slice), Some(sliceable)) = (&req.slice, endpoint.as_slice()) {
            return sliceable
                .read_slice(slice, checkpoint, req.filter.as_ref())
                .await
                .map_err(|e| TrellisError::Data(format!("read_slice failed: {e}")));
        }
        let source = endpoint.as_source().ok_or_else(|| {
            TrellisError::Config(format!(
                "endpoint {} has no source capability",
                req.template_id
            ))
        })?;
        source
            .read(&ReadRequest {
                dataset_id: req.dataset_id.clone(),
                checkpoint: checkpoint.clone(),
                mode: req.mode,
                filter: req.filter.clone(),
                params: req.policy.clone(),
            })
            .await
            .map_err(|e| TrellisError::Data(format!("read failed: {e}")))
    }

    async fn writer_for<'w>(
        &self,
        writer: &'w mut Option<StageWriter>,
        staging_req: &StagingRequest,
        slice_id: &str,
    ) -> Result<&'w mut StageWriter, TrellisError> {
        match writer {
            Some(w) => Ok(w),
            None => {
                let provider = self.staging.select(staging_req)?;
                let stage_id = uuid::Uuid::new_v4().to_string();
                let stage_ref = StageRef::new(provider.id(), &stage_id);
                Ok(writer.insert(StageWriter {
                    provider,
                    stage_ref,
                    slice_id: slice_id.to_string(),
                    next_seq: 0,
                    batch_refs: Vec::new(),
                }))
            }
        }
    }

    /// Normalize one source record into a sealed envelope.
    fn normalize_envelope(
        &self,
        record: Record,
        req: &RunSliceRequest,
        endpoint: &dyn Endpoint,
    ) -> RecordEnvelope {
        let observed_at = Utc::now();

        let entity_kind = record
            .get("_entityKind")
            .or_else(|| record.get("entityType"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                req.policy
                    .get("entityKind")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                req.dataset_id
                    .rsplit([':', '/'])
                    .next()
                    .filter(|s| !s.is_empty())
                    .unwrap_or("record")
                    .to_string()
            });

        let logical_id = profile::logical_id(&record).unwrap_or_else(|| {
            format!(
                "{}-{}",
                req.unit_id,
                observed_at.timestamp_nanos_opt().unwrap_or_default()
            )
        });

        let url = ["url", "html_url", "self", "link"]
            .iter()
            .filter_map(|k| record.get(*k).and_then(|v| v.as_str()))
            .find(|s| !s.is_empty())
            .map(str::to_string);

        // CDM mapping applies unless the run explicitly asked for raw.
        let (payload, record_kind) = if req.data_mode == DataMode::Raw {
            (record, RecordKind::Raw)
        } else {
            match self.registries.cdm.mapping_for(&req.dataset_id) {
                Some(mapping) => ((mapping.mapper)(&record), RecordKind::Cdm),
                None => (record, RecordKind::Raw),
            }
        };

        let vector_payload = match endpoint.as_vector_profile() {
            Some(provider) => match provider.normalize_for_index(&entity_kind, &payload) {
                Ok(vp) => vp,
                Err(e) => {
                    warn!(
                        logical_id = %logical_id,
                        error = %e,
                        "normalize_for_index failed, indexer will use the legacy normalizer"
                    );
                    None
                }
            },
            None => None,
        };

        RecordEnvelope {
            record_kind,
            entity_kind,
            source: RecordSource {
                endpoint_id: req.endpoint_id.clone(),
                source_family: endpoint.source_family().to_string(),
                source_id: req.dataset_id.clone(),
                url,
                external_id: Some(logical_id),
            },
            tenant_id: self.tenant_id.clone(),
            project_key: self.project_key.clone(),
            payload,
            vector_payload,
            observed_at,
        }
    }
}

struct StageWriter {
    provider: Arc<dyn StagingProvider>,
    stage_ref: StageRef,
    slice_id: String,
    next_seq: u32,
    batch_refs: Vec<BatchRef>,
}

impl StageWriter {
    async fn flush(
        &mut self,
        buffer: &mut Vec<RecordEnvelope>,
        stats: &mut RunSliceStats,
    ) -> Result<(), TrellisError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let result = self
            .provider
            .put_batch(&self.stage_ref.stage_id, &self.slice_id, self.next_seq, buffer)
            .await
            .map_err(|e| TrellisError::StagingUnavailable {
                message: format!("put_batch failed: {e}"),
                retryable: true,
            })?;

        self.next_seq += 1;
        self.batch_refs.push(result.batch_ref);
        stats.records_staged += result.count;
        stats.bytes_staged += result.bytes;
        stats.batches += 1;
        buffer.clear();
        Ok(())
    }
}

/// Preview payloads must be valid JSON. Serialization of JSON values
/// cannot normally fail, but when it does (pathological numerics), fall
/// back to stringifying cell by cell.
fn preview_value(rows: Vec<Value>) -> Value {
    if serde_json::to_string(&rows).is_ok() {
        return Value::Array(rows);
    }
    let stringified: Vec<Value> = rows
        .into_iter()
        .map(|row| match row {
            Value::Object(map) => {
                let cells: serde_json::Map<String, Value> = map
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v.to_string())))
                    .collect();
                Value::Object(cells)
            }
            other => Value::String(other.to_string()),
        })
        .collect();
    Value::Array(stringified)
}
