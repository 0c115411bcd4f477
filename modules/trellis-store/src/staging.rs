//! Staging provider contract and the provider registry with its selection
//! policy. A stage is a container of record envelopes produced by one
//! ingestion slice; batches within a stage are addressed by
//! `(sliceId, batchSeq)` and their refs sort in write order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;

use trellis_common::{BatchRef, RecordEnvelope, StageRef, TrellisError};

pub const MEMORY_PROVIDER_ID: &str = "memory";
pub const OBJECT_PROVIDER_ID: &str = "objectstore";

/// Total bytes the memory provider will hold before rejecting writes.
pub const DEFAULT_MEMORY_CAP_BYTES: u64 = 256 * 1024 * 1024;

/// Result of one `put_batch` call.
#[derive(Debug, Clone, PartialEq)]
pub struct PutBatchResult {
    pub stage_ref: StageRef,
    pub batch_ref: BatchRef,
    pub bytes: u64,
    pub count: u64,
}

/// Batched write/read of record envelopes.
#[async_trait::async_trait]
pub trait StagingProvider: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    /// True when staged data survives a process restart.
    fn durable(&self) -> bool;

    /// Write one batch atomically. The stage is created on the first call
    /// for a new `stage_id`. Fails once the stage is finalized.
    async fn put_batch(
        &self,
        stage_id: &str,
        slice_id: &str,
        batch_seq: u32,
        records: &[RecordEnvelope],
    ) -> Result<PutBatchResult>;

    async fn get_batch(
        &self,
        stage_ref: &StageRef,
        batch_ref: &BatchRef,
    ) -> Result<Vec<RecordEnvelope>>;

    /// Batch refs for a slice, in write order.
    async fn list_batches(&self, stage_ref: &StageRef, slice_id: &str) -> Result<Vec<BatchRef>>;

    /// Irreversible marker; further writes fail, reads keep working.
    async fn finalize_stage(&self, stage_ref: &StageRef) -> Result<()>;
}

/// Provider-selection inputs, mirroring the run request.
#[derive(Debug, Clone, Default)]
pub struct StagingRequest {
    /// Caller-supplied provider id; wins when set.
    pub provider_id: Option<String>,
    /// Policy flag forbidding the object store.
    pub disable_object_store: bool,
    pub estimated_bytes: u64,
}

/// Registered staging providers and the selection policy over them.
#[derive(Default)]
pub struct StagingRegistry {
    providers: RwLock<HashMap<String, Arc<dyn StagingProvider>>>,
}

impl StagingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn StagingProvider>) {
        let mut providers = self.providers.write().expect("staging registry poisoned");
        providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn StagingProvider>> {
        let providers = self.providers.read().expect("staging registry poisoned");
        providers.get(provider_id).cloned()
    }

    /// Selection policy:
    /// 1. An explicitly requested provider wins; requesting one that is not
    ///    registered is a non-retryable error. Requesting a provider while
    ///    also disabling the object store is a configuration error; the
    ///    precedence is ambiguous and must not be resolved silently.
    /// 2. Otherwise the object store, when registered and not disabled.
    /// 3. Otherwise memory, guarded by the estimated-size cap.
    pub fn select(&self, req: &StagingRequest) -> Result<Arc<dyn StagingProvider>, TrellisError> {
        if let Some(requested) = req.provider_id.as_deref() {
            if req.disable_object_store {
                return Err(TrellisError::StagingUnavailable {
                    message: format!(
                        "stagingProviderId={requested} conflicts with disableObjectStore=true"
                    ),
                    retryable: false,
                });
            }
            return self.get(requested).ok_or_else(|| TrellisError::StagingUnavailable {
                message: format!("requested staging provider not registered: {requested}"),
                retryable: false,
            });
        }

        if !req.disable_object_store {
            if let Some(provider) = self.get(OBJECT_PROVIDER_ID) {
                return Ok(provider);
            }
        }

        if req.estimated_bytes > DEFAULT_MEMORY_CAP_BYTES {
            return Err(TrellisError::StagingUnavailable {
                message: format!(
                    "no durable staging provider registered and estimated {} bytes exceeds the memory cap",
                    req.estimated_bytes
                ),
                retryable: true,
            });
        }

        self.get(MEMORY_PROVIDER_ID)
            .ok_or_else(|| TrellisError::StagingUnavailable {
                message: "no staging provider registered".to_string(),
                retryable: true,
            })
    }
}

/// Serialized size of one envelope batch, used for staging stats.
pub(crate) fn batch_bytes(records: &[RecordEnvelope]) -> Result<(Vec<Vec<u8>>, u64)> {
    let mut lines = Vec::with_capacity(records.len());
    let mut total = 0u64;
    for record in records {
        let line = serde_json::to_vec(record)?;
        total += line.len() as u64 + 1; // newline
        lines.push(line);
    }
    Ok((lines, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStagingProvider;

    fn registry_with_memory() -> StagingRegistry {
        let registry = StagingRegistry::new();
        registry.register(Arc::new(MemoryStagingProvider::new(DEFAULT_MEMORY_CAP_BYTES)));
        registry
    }

    #[test]
    fn explicit_provider_wins() {
        let registry = registry_with_memory();
        let provider = registry
            .select(&StagingRequest {
                provider_id: Some(MEMORY_PROVIDER_ID.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(provider.id(), MEMORY_PROVIDER_ID);
    }

    #[test]
    fn missing_explicit_provider_is_non_retryable() {
        let registry = registry_with_memory();
        let err = registry
            .select(&StagingRequest {
                provider_id: Some(OBJECT_PROVIDER_ID.to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), trellis_common::ErrorCode::StagingUnavailable);
        assert!(!err.retryable());
    }

    #[test]
    fn explicit_provider_with_disabled_object_store_is_config_error() {
        let registry = registry_with_memory();
        let err = registry
            .select(&StagingRequest {
                provider_id: Some(MEMORY_PROVIDER_ID.to_string()),
                disable_object_store: true,
                ..Default::default()
            })
            .unwrap_err();
        assert!(!err.retryable());
        assert!(err.to_string().contains("disableObjectStore"));
    }

    #[test]
    fn falls_back_to_memory_without_object_store() {
        let registry = registry_with_memory();
        let provider = registry.select(&StagingRequest::default()).unwrap();
        assert_eq!(provider.id(), MEMORY_PROVIDER_ID);
    }

    #[test]
    fn oversized_stage_without_durable_provider_errors() {
        let registry = registry_with_memory();
        let err = registry
            .select(&StagingRequest {
                estimated_bytes: DEFAULT_MEMORY_CAP_BYTES + 1,
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.retryable());
    }
}
