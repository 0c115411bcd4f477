//! Slice-runner scenarios: full ingest through memory staging, empty
//! slices, and the preview payload cap.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use trellis_common::{Config, DataMode, Record, RunMode, StageRef};
use trellis_endpoint::{EndpointFactory, Registries};
use trellis_pipeline::runner::RunSliceRequest;
use trellis_pipeline::testing::{record, ScriptedEndpoint};
use trellis_pipeline::SliceRunner;
use trellis_store::{MemoryStagingProvider, StagingRegistry, DEFAULT_MEMORY_CAP_BYTES};

fn scripted_factory(records: Vec<Record>) -> EndpointFactory {
    Arc::new(move |_config: &Record| {
        Ok(Arc::new(ScriptedEndpoint::new("scripted", "jira", records.clone()))
            as Arc<dyn trellis_endpoint::Endpoint>)
    })
}

fn setup(records: Vec<Record>) -> (SliceRunner, Arc<Registries>) {
    let registries = Arc::new(Registries::new());
    registries
        .endpoints
        .register("scripted", scripted_factory(records))
        .unwrap();

    let staging = Arc::new(StagingRegistry::new());
    staging.register(Arc::new(MemoryStagingProvider::new(DEFAULT_MEMORY_CAP_BYTES)));

    let runner = SliceRunner::new(Arc::clone(&registries), staging, &Config::for_tests());
    (runner, registries)
}

fn request(mode: RunMode) -> RunSliceRequest {
    RunSliceRequest {
        template_id: "scripted".to_string(),
        endpoint_id: "ep-1".to_string(),
        dataset_id: "jira:issues".to_string(),
        unit_id: "unit-1".to_string(),
        mode,
        data_mode: DataMode::Default,
        policy: Record::new(),
        checkpoint: Default::default(),
        slice: None,
        staging_provider_id: None,
        filter: None,
        transient_state: None,
        endpoint_config: Record::new(),
    }
}

#[tokio::test]
async fn full_ingest_with_memory_staging() {
    let (runner, _registries) = setup(vec![
        record(serde_json::json!({"id": "1", "title": "A"})),
        record(serde_json::json!({"id": "2", "title": "B"})),
    ]);

    let result = runner
        .run_slice(request(RunMode::Full), &CancellationToken::new())
        .await
        .unwrap();

    // One stage, one batch of two envelopes.
    let stage_ref = result.stage_ref.expect("stage created");
    let parsed = StageRef::parse(&stage_ref.to_string()).unwrap();
    assert_eq!(parsed.provider_id, "memory");
    assert_eq!(result.batch_refs.len(), 1);
    assert_eq!(result.stats.records_staged, 2);
    assert_eq!(result.records_staged, 2);
    assert!(result.bytes_staged > 0);

    // Checkpoint: lastRunAt set, recordCount 2, dataMode "".
    let cp = result.new_checkpoint;
    assert!(cp.last_run_at.is_some());
    assert_eq!(cp.record_count, Some(2));
    assert_eq!(cp.data_mode.as_deref(), Some(""));
}

#[tokio::test]
async fn empty_slice_stages_nothing_and_carries_checkpoint() {
    let (runner, _registries) = setup(vec![]);

    let mut req = request(RunMode::Full);
    req.checkpoint = serde_json::from_value(serde_json::json!({
        "watermark": "2026-01-01T00:00:00Z"
    }))
    .unwrap();

    let result = runner.run_slice(req, &CancellationToken::new()).await.unwrap();

    assert!(result.stage_ref.is_none());
    assert!(result.batch_refs.is_empty());
    assert_eq!(result.stats.records_staged, 0);
    // The watermark carries forward; lastRunAt is refreshed.
    assert_eq!(
        result.new_checkpoint.watermark.as_deref(),
        Some("2026-01-01T00:00:00Z")
    );
    assert!(result.new_checkpoint.last_run_at.is_some());
}

#[tokio::test]
async fn preview_under_cap_returns_rows_inline() {
    let (runner, _registries) = setup(vec![
        record(serde_json::json!({"id": "1", "title": "A"})),
        record(serde_json::json!({"id": "2", "title": "B"})),
    ]);

    let result = runner
        .run_slice(request(RunMode::Preview), &CancellationToken::new())
        .await
        .unwrap();

    // Inline preview, nothing staged.
    assert!(result.stage_ref.is_none());
    let preview = result.preview.expect("preview payload");
    let rows = preview.as_array().expect("inline rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["title"], "A");
}

#[tokio::test]
async fn preview_over_cap_is_staged_with_stub() {
    let big_body = "x".repeat(4_096);
    let records: Vec<Record> = (0..8)
        .map(|i| record(serde_json::json!({"id": i.to_string(), "title": "T", "body": big_body})))
        .collect();

    let registries = Arc::new(Registries::new());
    registries
        .endpoints
        .register("scripted", scripted_factory(records))
        .unwrap();
    let staging = Arc::new(StagingRegistry::new());
    staging.register(Arc::new(MemoryStagingProvider::new(DEFAULT_MEMORY_CAP_BYTES)));

    let mut config = Config::for_tests();
    config.max_payload_bytes = 8_192;
    let runner = SliceRunner::new(registries, staging, &config);

    let result = runner
        .run_slice(request(RunMode::Preview), &CancellationToken::new())
        .await
        .unwrap();

    let preview = result.preview.expect("preview payload");
    assert_eq!(preview["_preview"], "staged");
    assert_eq!(preview["rowCount"], 8);
    let records_path = preview["recordsPath"].as_str().unwrap();
    assert!(records_path.starts_with("memory:"));
    assert!(result.stage_ref.is_some());
    assert_eq!(result.records_staged, 8);
}
