//! Replay iterator over a staged run: walks the batch refs of a stage in
//! order and yields envelopes exactly as they were written.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;

use trellis_common::{BatchRef, RecordEnvelope, StageRef};

use crate::staging::StagingProvider;

pub struct StageReplay {
    provider: Arc<dyn StagingProvider>,
    stage_ref: StageRef,
    pending: VecDeque<BatchRef>,
    current: VecDeque<RecordEnvelope>,
    /// (batch_ref, offset-within-batch) of the last yielded envelope.
    position: Option<(BatchRef, u64)>,
}

impl StageReplay {
    pub fn new(
        provider: Arc<dyn StagingProvider>,
        stage_ref: StageRef,
        batch_refs: Vec<BatchRef>,
    ) -> Self {
        Self {
            provider,
            stage_ref,
            pending: batch_refs.into(),
            current: VecDeque::new(),
            position: None,
        }
    }

    /// Next envelope in stage order, or `None` when drained.
    pub async fn next(&mut self) -> Result<Option<RecordEnvelope>> {
        loop {
            if let Some(envelope) = self.current.pop_front() {
                if let Some((_, offset)) = &mut self.position {
                    *offset += 1;
                }
                return Ok(Some(envelope));
            }
            let Some(batch_ref) = self.pending.pop_front() else {
                return Ok(None);
            };
            let records = self.provider.get_batch(&self.stage_ref, &batch_ref).await?;
            self.position = Some((batch_ref, 0));
            self.current = records.into();
        }
    }

    /// The next whole batch, or `None` when drained. Skips any partially
    /// consumed batch.
    pub async fn next_batch(&mut self) -> Result<Option<(BatchRef, Vec<RecordEnvelope>)>> {
        self.current.clear();
        let Some(batch_ref) = self.pending.pop_front() else {
            return Ok(None);
        };
        let records = self.provider.get_batch(&self.stage_ref, &batch_ref).await?;
        self.position = Some((batch_ref.clone(), records.len() as u64));
        Ok(Some((batch_ref, records)))
    }

    /// Position of the last yielded envelope, for resumable checkpoints.
    pub fn position(&self) -> Option<(&BatchRef, u64)> {
        self.position.as_ref().map(|(b, o)| (b, *o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStagingProvider;
    use chrono::Utc;
    use trellis_common::{Record, RecordKind, RecordSource};

    fn envelope(id: &str) -> RecordEnvelope {
        let mut payload = Record::new();
        payload.insert("id".to_string(), serde_json::json!(id));
        RecordEnvelope {
            record_kind: RecordKind::Raw,
            entity_kind: "work_item".to_string(),
            source: RecordSource::default(),
            tenant_id: "dev".to_string(),
            project_key: "global".to_string(),
            payload,
            vector_payload: None,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn replay_preserves_write_order_across_batches() {
        let provider = Arc::new(MemoryStagingProvider::new(1024 * 1024));
        let mut refs = Vec::new();
        let mut expected = Vec::new();
        for seq in 0..3 {
            let batch: Vec<_> = (0..4).map(|i| envelope(&format!("{seq}-{i}"))).collect();
            let put = provider
                .put_batch("stage-r", "slice-0", seq, &batch)
                .await
                .unwrap();
            refs.push(put.batch_ref);
            expected.extend(batch);
        }

        let stage_ref = StageRef::new("memory", "stage-r");
        let mut replay = StageReplay::new(provider, stage_ref, refs);
        let mut seen = Vec::new();
        while let Some(envelope) = replay.next().await.unwrap() {
            seen.push(envelope);
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn empty_replay_yields_nothing() {
        let provider = Arc::new(MemoryStagingProvider::new(1024));
        let mut replay = StageReplay::new(provider, StageRef::new("memory", "none"), vec![]);
        assert!(replay.next().await.unwrap().is_none());
        assert!(replay.position().is_none());
    }
}
