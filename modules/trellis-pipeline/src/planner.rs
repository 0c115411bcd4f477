//! Slice planner: turn a dataset and strategy into bounded, resumable
//! slices. Slicing itself is the endpoint's business when it is capable;
//! the planner handles strategy dispatch, target-size policy resolution
//! and plan metadata.

use anyhow::Result;
use tracing::info;

use trellis_common::{Checkpoint, IngestionPlan, PlanStrategy, Record, Slice};
use trellis_endpoint::{CdmRegistry, Endpoint};
use trellis_store::normalize_for_read;

/// Policy keys checked for the target slice size, in order, at the top
/// level and nested under `parameters`.
const TARGET_SIZE_KEYS: &[&str] = &[
    "targetSliceSize",
    "target_slice_size",
    "targetRowsPerSlice",
    "target_rows_per_slice",
];

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub template_id: String,
    pub dataset_id: String,
    pub strategy: PlanStrategy,
    pub checkpoint: Checkpoint,
    pub policy: Record,
}

/// Resolve the target slice size from the policy. Zero means
/// endpoint-default.
pub fn resolve_target_slice_size(policy: &Record) -> u64 {
    fn lookup(map: &Record) -> Option<u64> {
        TARGET_SIZE_KEYS
            .iter()
            .filter_map(|k| map.get(*k))
            .find_map(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
    }

    if let Some(size) = lookup(policy) {
        return size;
    }
    if let Some(parameters) = policy.get("parameters").and_then(|v| v.as_object()) {
        if let Some(size) = lookup(parameters) {
            return size;
        }
    }
    0
}

pub async fn plan(
    endpoint: &dyn Endpoint,
    cdm: &CdmRegistry,
    req: &PlanRequest,
) -> Result<IngestionPlan> {
    let checkpoint = normalize_for_read(&req.checkpoint);
    let target_slice_size = resolve_target_slice_size(&req.policy);

    let mut statistics: Option<Record> = None;
    let slices: Vec<Slice> = match req.strategy {
        PlanStrategy::Full => match endpoint.as_slice() {
            Some(sliceable) => {
                sliceable
                    .plan_slices(&req.dataset_id, PlanStrategy::Full, &checkpoint, target_slice_size)
                    .await?
            }
            None => vec![Slice::full()],
        },
        PlanStrategy::Incremental => match endpoint.as_slice() {
            Some(sliceable) => {
                sliceable
                    .plan_slices(
                        &req.dataset_id,
                        PlanStrategy::Incremental,
                        &checkpoint,
                        target_slice_size,
                    )
                    .await?
            }
            None => {
                // Single open-ended slice starting at the watermark.
                let mut slice = Slice::full();
                slice.lower = checkpoint.effective_watermark().map(str::to_string);
                vec![slice]
            }
        },
        PlanStrategy::Adaptive => match endpoint.as_adaptive() {
            Some(adaptive) => {
                let probe = adaptive.probe_ingestion(&req.dataset_id).await?;
                let planned = adaptive
                    .plan_ingestion(&req.dataset_id, &probe, target_slice_size)
                    .await?;
                let mut stats = probe.statistics.clone();
                stats.insert(
                    "estimatedRows".to_string(),
                    serde_json::json!(probe.estimated_rows),
                );
                stats.insert(
                    "estimatedBytes".to_string(),
                    serde_json::json!(probe.estimated_bytes),
                );
                statistics = Some(stats);
                planned
            }
            None => match endpoint.as_slice() {
                Some(sliceable) => {
                    sliceable
                        .plan_slices(
                            &req.dataset_id,
                            PlanStrategy::Adaptive,
                            &checkpoint,
                            target_slice_size,
                        )
                        .await?
                }
                None => vec![Slice::full()],
            },
        },
    };

    // Schema resolution: CDM registry mapping first, then the endpoint's
    // own metadata, else null.
    let cdm_model_id = cdm.mapping_for(&req.dataset_id).map(|m| m.model_id);
    let schema = match cdm_model_id.as_deref().and_then(|m| cdm.schema_for(m)) {
        Some(schema) => Some(schema),
        None => match endpoint.as_metadata() {
            Some(metadata) => metadata.get_schema(&req.dataset_id).await?,
            None => None,
        },
    };

    let plan = IngestionPlan {
        dataset_id: req.dataset_id.clone(),
        template_id: req.template_id.clone(),
        strategy: req.strategy,
        slice_count: slices.len() as u32,
        slices,
        target_slice_size,
        statistics,
        schema,
        cdm_model_id,
    };

    info!(
        dataset_id = %plan.dataset_id,
        strategy = %plan.strategy,
        slices = plan.slice_count,
        target_slice_size = plan.target_slice_size,
        "Ingestion plan ready"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(json: serde_json::Value) -> Record {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn target_size_keys_in_order() {
        assert_eq!(
            resolve_target_slice_size(&policy(serde_json::json!({"targetSliceSize": 500}))),
            500
        );
        assert_eq!(
            resolve_target_slice_size(&policy(serde_json::json!({"target_slice_size": "250"}))),
            250
        );
        assert_eq!(
            resolve_target_slice_size(&policy(serde_json::json!({"targetRowsPerSlice": 100}))),
            100
        );
        assert_eq!(
            resolve_target_slice_size(&policy(serde_json::json!({"target_rows_per_slice": 10}))),
            10
        );
    }

    #[test]
    fn target_size_falls_back_to_nested_parameters() {
        let p = policy(serde_json::json!({"parameters": {"targetSliceSize": 77}}));
        assert_eq!(resolve_target_slice_size(&p), 77);
    }

    #[test]
    fn target_size_zero_means_endpoint_default() {
        assert_eq!(resolve_target_slice_size(&Record::new()), 0);
    }
}
