//! Object-store staging provider. The default durable provider, backed by
//! MinIO/S3 in production and `object_store`'s in-memory implementation in
//! tests.
//!
//! Layout: `<basePrefix>/<stageId>/<sliceId>/<zero-padded-batchSeq>.ndjson`,
//! one JSON envelope per line. Finalization writes a `_FINAL` sentinel.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};

use trellis_common::{BatchRef, Config, RecordEnvelope, StageRef};

use crate::staging::{batch_bytes, PutBatchResult, StagingProvider, OBJECT_PROVIDER_ID};

const FINAL_SENTINEL: &str = "_FINAL";

/// The shared MinIO-backed object store, or `None` when MinIO is not
/// configured. Staging and the log store run over the same bucket.
pub fn minio_object_store(config: &Config) -> Result<Option<Arc<dyn ObjectStore>>> {
    let (Some(endpoint), Some(access_key), Some(secret_key)) = (
        config.minio_endpoint.as_deref(),
        config.minio_access_key.as_deref(),
        config.minio_secret_key.as_deref(),
    ) else {
        return Ok(None);
    };

    let store = AmazonS3Builder::new()
        .with_endpoint(endpoint)
        .with_bucket_name(&config.minio_bucket)
        .with_access_key_id(access_key)
        .with_secret_access_key(secret_key)
        .with_region("us-east-1")
        .with_allow_http(true)
        .build()
        .context("building MinIO object store")?;

    Ok(Some(Arc::new(store)))
}

#[derive(Debug)]
pub struct ObjectStagingProvider {
    store: Arc<dyn ObjectStore>,
    base_prefix: String,
}

impl ObjectStagingProvider {
    pub fn new(store: Arc<dyn ObjectStore>, base_prefix: impl Into<String>) -> Self {
        Self {
            store,
            base_prefix: base_prefix.into(),
        }
    }

    /// Build against MinIO from config. Returns `None` when MinIO is not
    /// configured; the registry then falls back to memory staging.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        Ok(minio_object_store(config)?
            .map(|store| Self::new(store, config.minio_stage_prefix.clone())))
    }

    fn batch_path(&self, stage_id: &str, batch_ref: &BatchRef) -> Path {
        Path::from(format!(
            "{}/{}/{}/{:08}.ndjson",
            self.base_prefix, stage_id, batch_ref.slice_id, batch_ref.batch_seq
        ))
    }

    fn final_path(&self, stage_id: &str) -> Path {
        Path::from(format!("{}/{}/{}", self.base_prefix, stage_id, FINAL_SENTINEL))
    }

    async fn is_finalized(&self, stage_id: &str) -> Result<bool> {
        match self.store.head(&self.final_path(stage_id)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl StagingProvider for ObjectStagingProvider {
    fn id(&self) -> &str {
        OBJECT_PROVIDER_ID
    }

    fn durable(&self) -> bool {
        true
    }

    async fn put_batch(
        &self,
        stage_id: &str,
        slice_id: &str,
        batch_seq: u32,
        records: &[RecordEnvelope],
    ) -> Result<PutBatchResult> {
        if self.is_finalized(stage_id).await? {
            bail!("stage {stage_id} is finalized");
        }

        let (lines, bytes) = batch_bytes(records)?;
        let mut body = Vec::with_capacity(bytes as usize);
        for line in &lines {
            body.extend_from_slice(line);
            body.push(b'\n');
        }

        let batch_ref = BatchRef::new(slice_id, batch_seq);
        let path = self.batch_path(stage_id, &batch_ref);
        self.store
            .put(&path, PutPayload::from(Bytes::from(body)))
            .await
            .with_context(|| format!("staging batch {batch_ref} to {path}"))?;

        Ok(PutBatchResult {
            stage_ref: StageRef::new(OBJECT_PROVIDER_ID, stage_id),
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
        let path = self.batch_path(&stage_ref.stage_id, batch_ref);
        let bytes = self
            .store
            .get(&path)
            .await
            .with_context(|| format!("reading batch {batch_ref} from {path}"))?
            .bytes()
            .await?;

        let mut records = Vec::new();
        for line in bytes.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let envelope: RecordEnvelope = serde_json::from_slice(line)
                .with_context(|| format!("corrupt envelope line in {path}"))?;
            records.push(envelope);
        }
        Ok(records)
    }

    async fn list_batches(&self, stage_ref: &StageRef, slice_id: &str) -> Result<Vec<BatchRef>> {
        let prefix = Path::from(format!(
            "{}/{}/{}",
            self.base_prefix, stage_ref.stage_id, slice_id
        ));
        let metas: Vec<object_store::ObjectMeta> =
            self.store.list(Some(&prefix)).try_collect().await?;

        let mut refs = Vec::with_capacity(metas.len());
        for meta in metas {
            let Some(name) = meta.location.filename() else {
                continue;
            };
            let Some(seq_str) = name.strip_suffix(".ndjson") else {
                continue;
            };
            let batch_seq: u32 = seq_str
                .parse()
                .map_err(|_| anyhow!("unexpected batch object name: {name}"))?;
            refs.push(BatchRef::new(slice_id, batch_seq));
        }
        refs.sort();
        Ok(refs)
    }

    async fn finalize_stage(&self, stage_ref: &StageRef) -> Result<()> {
        let path = self.final_path(&stage_ref.stage_id);
        self.store
            .put(&path, PutPayload::from(Bytes::new()))
            .await
            .with_context(|| format!("writing finalize sentinel {path}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use object_store::memory::InMemory;
    use trellis_common::{Record, RecordKind, RecordSource};

    fn provider() -> ObjectStagingProvider {
        ObjectStagingProvider::new(Arc::new(InMemory::new()), "stages")
    }

    fn envelope(id: &str) -> RecordEnvelope {
        let mut payload = Record::new();
        payload.insert("id".to_string(), serde_json::json!(id));
        RecordEnvelope {
            record_kind: RecordKind::Raw,
            entity_kind: "document".to_string(),
            source: RecordSource {
                endpoint_id: "ep-1".to_string(),
                source_family: "confluence".to_string(),
                source_id: "space-1".to_string(),
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
    async fn batches_round_trip_in_order() {
        let provider = provider();
        let a: Vec<_> = (0..3).map(|i| envelope(&format!("a{i}"))).collect();
        let b: Vec<_> = (0..2).map(|i| envelope(&format!("b{i}"))).collect();

        let first = provider.put_batch("s1", "slice-0", 0, &a).await.unwrap();
        let second = provider.put_batch("s1", "slice-0", 1, &b).await.unwrap();
        assert_eq!(first.stage_ref.to_string(), "objectstore:s1");

        let batches = provider
            .list_batches(&first.stage_ref, "slice-0")
            .await
            .unwrap();
        assert_eq!(batches, vec![first.batch_ref.clone(), second.batch_ref.clone()]);

        let mut replayed = Vec::new();
        for batch in &batches {
            replayed.extend(provider.get_batch(&first.stage_ref, batch).await.unwrap());
        }
        let expected: Vec<_> = a.into_iter().chain(b).collect();
        assert_eq!(replayed, expected);
    }

    #[tokio::test]
    async fn finalize_blocks_writes_and_keeps_reads() {
        let provider = provider();
        let put = provider
            .put_batch("s2", "slice-0", 0, &[envelope("x")])
            .await
            .unwrap();

        provider.finalize_stage(&put.stage_ref).await.unwrap();

        let err = provider
            .put_batch("s2", "slice-0", 1, &[envelope("y")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("finalized"));

        let records = provider.get_batch(&put.stage_ref, &put.batch_ref).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn sentinel_is_excluded_from_listing() {
        let provider = provider();
        let put = provider
            .put_batch("s3", "slice-0", 0, &[envelope("x")])
            .await
            .unwrap();
        provider.finalize_stage(&put.stage_ref).await.unwrap();

        let batches = provider
            .list_batches(&put.stage_ref, "slice-0")
            .await
            .unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn batch_seq_padding_keeps_lexicographic_order_past_ten() {
        let provider = provider();
        for seq in 0..12 {
            provider
                .put_batch("s4", "slice-0", seq, &[envelope(&format!("r{seq}"))])
                .await
                .unwrap();
        }
        let stage_ref = StageRef::new(OBJECT_PROVIDER_ID, "s4");
        let batches = provider.list_batches(&stage_ref, "slice-0").await.unwrap();
        let seqs: Vec<u32> = batches.iter().map(|b| b.batch_seq).collect();
        assert_eq!(seqs, (0..12).collect::<Vec<_>>());
    }
}
