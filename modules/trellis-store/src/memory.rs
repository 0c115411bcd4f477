//! In-memory staging provider. Non-durable, bounded by a byte cap.
//! Finalization flips a write guard but persists nothing; there is no
//! sentinel to write.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use uuid::Uuid;

use trellis_common::{BatchRef, RecordEnvelope, StageRef};

use crate::staging::{batch_bytes, PutBatchResult, StagingProvider, MEMORY_PROVIDER_ID};

#[derive(Debug)]
struct StageState {
    batches: BTreeMap<BatchRef, Vec<RecordEnvelope>>,
    finalized: bool,
}

#[derive(Debug)]
pub struct MemoryStagingProvider {
    stages: RwLock<HashMap<String, StageState>>,
    cap_bytes: u64,
    used_bytes: RwLock<u64>,
}

impl MemoryStagingProvider {
    pub fn new(cap_bytes: u64) -> Self {
        Self {
            stages: RwLock::new(HashMap::new()),
            cap_bytes,
            used_bytes: RwLock::new(0),
        }
    }

    /// Fresh stage id for callers that want one up front.
    pub fn new_stage_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Drop a stage and release its bytes.
    pub fn drop_stage(&self, stage_ref: &StageRef) {
        let mut stages = self.stages.write().expect("memory staging poisoned");
        if let Some(state) = stages.remove(&stage_ref.stage_id) {
            let freed: u64 = state
                .batches
                .values()
                .flatten()
                .filter_map(|e| serde_json::to_vec(e).ok())
                .map(|v| v.len() as u64)
                .sum();
            let mut used = self.used_bytes.write().expect("memory staging poisoned");
            *used = used.saturating_sub(freed);
        }
    }
}

#[async_trait::async_trait]
impl StagingProvider for MemoryStagingProvider {
    fn id(&self) -> &str {
        MEMORY_PROVIDER_ID
    }

    fn durable(&self) -> bool {
        false
    }

    async fn put_batch(
        &self,
        stage_id: &str,
        slice_id: &str,
        batch_seq: u32,
        records: &[RecordEnvelope],
    ) -> Result<PutBatchResult> {
        let (_, bytes) = batch_bytes(records)?;
        let batch_ref = BatchRef::new(slice_id, batch_seq);

        let mut stages = self.stages.write().expect("memory staging poisoned");
        let state = stages.entry(stage_id.to_string()).or_insert_with(|| StageState {
            batches: BTreeMap::new(),
            finalized: false,
        });
        if state.finalized {
            bail!("stage {stage_id} is finalized");
        }
        {
            let mut used = self.used_bytes.write().expect("memory staging poisoned");
            if *used + bytes > self.cap_bytes {
                bail!(
                    "memory staging cap exceeded: {} + {} > {}",
                    *used,
                    bytes,
                    self.cap_bytes
                );
            }
            *used += bytes;
        }
        state.batches.insert(batch_ref.clone(), records.to_vec());
        drop(stages);

        Ok(PutBatchResult {
            stage_ref: StageRef::new(MEMORY_PROVIDER_ID, stage_id),
            batch_ref,
            bytes,
            count: records.len() as u64,
        })
    }

    async fn get_batch(
        &self,
        stage_ref: &StageRef,
        batch_ref: &BatchRef,
    ) -> Result<Vec<RecordEnvelope>> {
        let stages = self.stages.read().expect("memory staging poisoned");
        let state = stages
            .get(&stage_ref.stage_id)
            .ok_or_else(|| anyhow!("unknown stage: {stage_ref}"))?;
        state
            .batches
            .get(batch_ref)
            .cloned()
            .ok_or_else(|| anyhow!("unknown batch {batch_ref} in stage {stage_ref}"))
    }

    async fn list_batches(&self, stage_ref: &StageRef, slice_id: &str) -> Result<Vec<BatchRef>> {
        let stages = self.stages.read().expect("memory staging poisoned");
        let state = stages
            .get(&stage_ref.stage_id)
            .ok_or_else(|| anyhow!("unknown stage: {stage_ref}"))?;
        Ok(state
            .batches
            .keys()
            .filter(|b| b.slice_id == slice_id)
            .cloned()
            .collect())
    }

    async fn finalize_stage(&self, stage_ref: &StageRef) -> Result<()> {
        let mut stages = self.stages.write().expect("memory staging poisoned");
        if let Some(state) = stages.get_mut(&stage_ref.stage_id) {
            state.finalized = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trellis_common::{RecordKind, RecordSource};

    fn envelope(id: &str) -> RecordEnvelope {
        let mut payload = trellis_common::Record::new();
        payload.insert("id".to_string(), serde_json::json!(id));
        RecordEnvelope {
            record_kind: RecordKind::Raw,
            entity_kind: "work_item".to_string(),
            source: RecordSource {
                endpoint_id: "ep-1".to_string(),
                source_family: "jira".to_string(),
                source_id: "src-1".to_string(),
                url: None,
                external_id: Some(id.to_string()),
            },
            tenant_id: "dev".to_string(),
            project_key: "global".to_string(),
            payload,
            vector_payload: None,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips_in_order() {
        let provider = MemoryStagingProvider::new(1024 * 1024);
        let records: Vec<RecordEnvelope> = (0..5).map(|i| envelope(&format!("r{i}"))).collect();

        let first = provider
            .put_batch("stage-1", "slice-0", 0, &records[..3])
            .await
            .unwrap();
        let second = provider
            .put_batch("stage-1", "slice-0", 1, &records[3..])
            .await
            .unwrap();
        assert_eq!(first.count, 3);
        assert_eq!(second.count, 2);

        let stage_ref = first.stage_ref.clone();
        let batches = provider.list_batches(&stage_ref, "slice-0").await.unwrap();
        assert_eq!(batches, vec![first.batch_ref.clone(), second.batch_ref.clone()]);

        let mut replayed = Vec::new();
        for batch in &batches {
            replayed.extend(provider.get_batch(&stage_ref, batch).await.unwrap());
        }
        assert_eq!(replayed, records);
    }

    #[tokio::test]
    async fn finalized_stage_rejects_writes_but_serves_reads() {
        let provider = MemoryStagingProvider::new(1024 * 1024);
        let put = provider
            .put_batch("stage-f", "slice-0", 0, &[envelope("a")])
            .await
            .unwrap();

        provider.finalize_stage(&put.stage_ref).await.unwrap();

        let err = provider
            .put_batch("stage-f", "slice-0", 1, &[envelope("b")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("finalized"));

        let records = provider.get_batch(&put.stage_ref, &put.batch_ref).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn byte_cap_is_enforced() {
        let provider = MemoryStagingProvider::new(64);
        let err = provider
            .put_batch("stage-c", "slice-0", 0, &[envelope("too-big")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cap exceeded"));
    }

    #[tokio::test]
    async fn stage_ref_parses_to_memory_provider() {
        let provider = MemoryStagingProvider::new(1024 * 1024);
        let put = provider
            .put_batch(&MemoryStagingProvider::new_stage_id(), "slice-0", 0, &[envelope("a")])
            .await
            .unwrap();
        let parsed = StageRef::parse(&put.stage_ref.to_string()).unwrap();
        assert_eq!(parsed.provider_id, "memory");
    }
}
