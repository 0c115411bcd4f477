//! End-to-end operation flow: start → plan → ingest → index → cluster →
//! signal → insight, against in-memory collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use trellis_common::{
    Config, ImplMode, OperationStatus, Record, SignalDefinition, SignalInstance, SignalSeverity,
    SignalStatus, SignalStore, Slice,
};
use trellis_endpoint::{EndpointFactory, Registries, ValidationReport};
use trellis_pipeline::driver::{OperationRequest, PipelineDeps, PipelineDriver};
use trellis_pipeline::insight::skill::SkillRegistry;
use trellis_pipeline::testing::{
    record, FixedEmbedder, MemoryKv, MemorySignalStore, MemoryVectorStore, RecordingGraph,
    ScriptedEndpoint, TEST_EMBEDDING_DIM,
};
use trellis_pipeline::OperationManager;
use trellis_store::{
    indexer_key, CheckpointEngine, MemoryStagingProvider, StagingRegistry,
    DEFAULT_MEMORY_CAP_BYTES,
};

struct Harness {
    driver: PipelineDriver,
    vectors: Arc<MemoryVectorStore>,
    kv: Arc<MemoryKv>,
    signals: Arc<MemorySignalStore>,
}

fn harness(factory: EndpointFactory) -> Harness {
    let registries = Arc::new(Registries::new());
    registries.endpoints.register("scripted", factory).unwrap();

    let staging = Arc::new(StagingRegistry::new());
    staging.register(Arc::new(MemoryStagingProvider::new(DEFAULT_MEMORY_CAP_BYTES)));

    let kv = Arc::new(MemoryKv::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let signals = Arc::new(MemorySignalStore::new());
    let checkpoints = Arc::new(CheckpointEngine::new(kv.clone() as Arc<_>, None));

    let deps = PipelineDeps {
        registries,
        staging,
        kv: kv.clone() as Arc<_>,
        vectors: vectors.clone() as Arc<_>,
        signals: signals.clone() as Arc<_>,
        graph: Arc::new(RecordingGraph::new()) as Arc<_>,
        embedder: Arc::new(FixedEmbedder::new(TEST_EMBEDDING_DIM)) as Arc<_>,
        chat: None,
        skills: Arc::new(SkillRegistry::with_builtins().unwrap()),
        checkpoints,
        log: None,
        artifacts: None,
        manager: Arc::new(OperationManager::new()),
        config: Config::for_tests(),
    };
    Harness {
        driver: PipelineDriver::new(deps),
        vectors,
        kv,
        signals,
    }
}

fn scripted_factory(records: Vec<Record>, valid: bool) -> EndpointFactory {
    Arc::new(move |_config: &Record| {
        let endpoint = ScriptedEndpoint::new("scripted", "jira", records.clone());
        let endpoint = if valid {
            endpoint
        } else {
            endpoint.with_validation(ValidationReport::invalid("auth token rejected"))
        };
        Ok(Arc::new(endpoint) as Arc<dyn trellis_endpoint::Endpoint>)
    })
}

fn sliced_factory(slices: Vec<(Slice, Vec<Record>)>) -> EndpointFactory {
    Arc::new(move |_config: &Record| {
        let endpoint =
            ScriptedEndpoint::new("scripted", "jira", vec![]).with_slices(slices.clone());
        Ok(Arc::new(endpoint) as Arc<dyn trellis_endpoint::Endpoint>)
    })
}

fn request() -> OperationRequest {
    OperationRequest {
        kind: "ingest".to_string(),
        template_id: "scripted".to_string(),
        endpoint_id: "ep-1".to_string(),
        parameters: HashMap::from([("datasetId".to_string(), "jira:issues".to_string())]),
        idempotency_key: "op-key-1".to_string(),
    }
}

fn slice(slice_id: &str, sequence: u32) -> Slice {
    Slice {
        slice_id: slice_id.to_string(),
        sequence,
        lower: None,
        upper: None,
        params: Record::new(),
        estimated_rows: None,
    }
}

fn stale_definition() -> SignalDefinition {
    SignalDefinition {
        id: "def-stale".to_string(),
        slug: "stale-work-item".to_string(),
        source_family: "jira".to_string(),
        entity_kind: "work_item".to_string(),
        severity: SignalSeverity::Info,
        title: Some("Stale work item".to_string()),
        impl_mode: ImplMode::Dsl,
        definition_spec: Some(serde_json::json!({
            "version": 1,
            "type": "cdm.work.stale_item",
            "maxAge": {"unit": "days", "value": 7}
        })),
    }
}

fn open_instance(entity_ref: &str) -> SignalInstance {
    SignalInstance {
        definition_id: "def-stale".to_string(),
        entity_ref: entity_ref.to_string(),
        entity_kind: "work_item".to_string(),
        severity: SignalSeverity::Info,
        status: SignalStatus::Open,
        summary: "carried over from an earlier run".to_string(),
        details: Default::default(),
        source_run_id: "run-0".to_string(),
    }
}

fn stale_issue(id: &str) -> Record {
    record(serde_json::json!({
        "_externalId": id,
        "id": id,
        "title": format!("Issue {id}"),
        "updatedAt": (Utc::now() - Duration::days(10)).to_rfc3339()
    }))
}

#[tokio::test]
async fn successful_operation_runs_every_stage() {
    let records = vec![
        record(serde_json::json!({
            "_externalId": "JIRA-1", "title": "Fix login", "description": "expired sessions"
        })),
        record(serde_json::json!({
            "_externalId": "JIRA-2", "title": "Upgrade db", "description": "postgres"
        })),
    ];
    let harness = harness(scripted_factory(records, true));
    let manager = harness.driver.manager();

    let (operation_id, created) = manager.start("ingest", "op-key-1");
    assert!(created);

    harness
        .driver
        .execute(&operation_id, request(), CancellationToken::new())
        .await;

    let snapshot = manager.get(&operation_id).unwrap();
    assert_eq!(snapshot.status, OperationStatus::Succeeded);
    assert_eq!(snapshot.stats.records_staged, 2);
    assert_eq!(snapshot.stats.slices_total, 1);
    assert_eq!(snapshot.stats.slices_done, 1);
    assert!(snapshot.stats.stage_ref.is_some());
    assert!(snapshot.error.is_none());

    // Both records made it into the vector store.
    assert_eq!(harness.vectors.len(), 2);
    assert!(harness.vectors.entry("JIRA-1").is_some());
}

#[tokio::test]
async fn signal_reconciliation_spans_all_slices_of_the_run() {
    // Two slices, one matching record each. JIRA-2 lives in the second
    // slice; a pre-existing OPEN instance for it must never pass through
    // RESOLVED while the first slice is processed.
    let slices = vec![
        (slice("s0", 0), vec![stale_issue("JIRA-1")]),
        (slice("s1", 1), vec![stale_issue("JIRA-2")]),
    ];
    let harness = harness(sliced_factory(slices));
    harness
        .signals
        .upsert_definition(&stale_definition())
        .await
        .unwrap();
    harness
        .signals
        .upsert_instance(&open_instance("JIRA-2"))
        .await
        .unwrap();
    // An entity absent from the whole run resolves exactly once.
    harness
        .signals
        .upsert_instance(&open_instance("GONE-1"))
        .await
        .unwrap();

    let manager = harness.driver.manager();
    let (operation_id, _) = manager.start("ingest", "op-key-1");
    let mut req = request();
    req.parameters.insert(
        "policy".to_string(),
        serde_json::json!({"entityKind": "work_item"}).to_string(),
    );
    harness
        .driver
        .execute(&operation_id, req, CancellationToken::new())
        .await;

    let snapshot = manager.get(&operation_id).unwrap();
    assert_eq!(snapshot.status, OperationStatus::Succeeded);
    assert_eq!(snapshot.stats.slices_total, 2);
    assert_eq!(snapshot.stats.slices_done, 2);

    assert_eq!(
        harness.signals.instance("def-stale", "JIRA-1").unwrap().status,
        SignalStatus::Open
    );
    assert_eq!(
        harness.signals.instance("def-stale", "JIRA-2").unwrap().status,
        SignalStatus::Open
    );
    assert_eq!(
        harness.signals.instance("def-stale", "GONE-1").unwrap().status,
        SignalStatus::Resolved
    );

    // No flapping: JIRA-2 was matched by slice two, so it must never
    // have been transitioned at all.
    let updates = harness.signals.status_updates();
    assert!(!updates
        .iter()
        .any(|(def, entity, _)| def == "def-stale" && entity == "JIRA-2"));
    let gone_resolutions = updates
        .iter()
        .filter(|(def, entity, status)| {
            def == "def-stale" && entity == "GONE-1" && *status == SignalStatus::Resolved
        })
        .count();
    assert_eq!(gone_resolutions, 1);
}

#[tokio::test]
async fn preview_leaves_checkpoints_and_signals_untouched() {
    let records = vec![stale_issue("JIRA-1"), stale_issue("JIRA-2")];
    let harness = harness(scripted_factory(records, true));
    harness
        .signals
        .upsert_definition(&stale_definition())
        .await
        .unwrap();
    harness
        .signals
        .upsert_instance(&open_instance("OLD-1"))
        .await
        .unwrap();

    let manager = harness.driver.manager();
    let (operation_id, _) = manager.start("ingest", "op-key-1");
    let mut req = request();
    req.parameters
        .insert("mode".to_string(), "preview".to_string());
    harness
        .driver
        .execute(&operation_id, req, CancellationToken::new())
        .await;

    let snapshot = manager.get(&operation_id).unwrap();
    assert_eq!(snapshot.status, OperationStatus::Succeeded);

    // A dry run advances nothing: no checkpoint write, no vectors, no
    // embed hashes, no signal transitions.
    let scope = trellis_pipeline::testing::test_scope();
    assert!(harness
        .kv
        .value(&scope, &indexer_key("cdm.work_item.v1", "jira-issues"))
        .is_none());
    assert!(harness.kv.is_empty());
    assert!(harness.vectors.is_empty());
    assert!(harness.signals.status_updates().is_empty());
    assert_eq!(
        harness.signals.instance("def-stale", "OLD-1").unwrap().status,
        SignalStatus::Open
    );
}

#[tokio::test]
async fn repeated_start_with_same_key_returns_existing_operation() {
    let harness = harness(scripted_factory(vec![], true));
    let manager = harness.driver.manager();

    let (first, created_first) = manager.start("ingest", "op-key-1");
    let (second, created_second) = manager.start("ingest", "op-key-1");
    assert!(created_first);
    assert!(!created_second);
    assert_eq!(first, second);
}

#[tokio::test]
async fn invalid_config_fails_with_auth_code() {
    let harness = harness(scripted_factory(vec![], false));
    let manager = harness.driver.manager();

    let (operation_id, _) = manager.start("ingest", "op-key-2");
    harness
        .driver
        .execute(&operation_id, request(), CancellationToken::new())
        .await;

    let snapshot = manager.get(&operation_id).unwrap();
    assert_eq!(snapshot.status, OperationStatus::Failed);
    let error = snapshot.error.unwrap();
    assert_eq!(error.code, trellis_common::ErrorCode::AuthInvalid);
    assert!(!error.retryable);
}

#[tokio::test]
async fn unknown_template_fails_with_not_found() {
    let harness = harness(scripted_factory(vec![], true));
    let manager = harness.driver.manager();

    let (operation_id, _) = manager.start("ingest", "op-key-3");
    let mut req = request();
    req.template_id = "ghost".to_string();
    harness
        .driver
        .execute(&operation_id, req, CancellationToken::new())
        .await;

    let snapshot = manager.get(&operation_id).unwrap();
    assert_eq!(snapshot.status, OperationStatus::Failed);
    assert_eq!(
        snapshot.error.unwrap().code,
        trellis_common::ErrorCode::EndpointNotFound
    );
}
