//! Signal lifecycle over three runs of a `cdm.work.stale_item`
//! definition: OPEN on first match, RESOLVED when it stops matching,
//! OPEN again under the same key when it matches anew. Suppressed
//! instances never move.

use std::sync::Arc;

use chrono::{Duration, Utc};

use trellis_common::{
    ImplMode, SignalDefinition, SignalInstance, SignalSeverity, SignalStatus, SignalStore,
};
use trellis_pipeline::signal::SignalEngine;
use trellis_pipeline::testing::{envelope, MemorySignalStore, RecordingGraph};
use trellis_pipeline::KbEventLog;

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

async fn run_once(
    engine: &SignalEngine,
    run_id: &str,
    days_stale: i64,
) -> trellis_pipeline::SignalStats {
    let record = envelope(
        "jira",
        "work_item",
        serde_json::json!({
            "id": "JIRA-1",
            "title": "Forgotten migration",
            "updatedAt": (Utc::now() - Duration::days(days_stale)).to_rfc3339()
        }),
    );

    let mut events = KbEventLog::new("kb", run_id);
    let mut session = engine.session("jira", run_id).await.unwrap();
    session.observe(&record, &mut events).await.unwrap();
    session.reconcile(&mut events).await.unwrap()
}

#[tokio::test]
async fn open_resolve_reopen_under_the_same_key() {
    let store = Arc::new(MemorySignalStore::new());
    let graph = Arc::new(RecordingGraph::new());
    store.upsert_definition(&stale_definition()).await.unwrap();

    let engine = SignalEngine::new(store.clone() as Arc<_>, graph as Arc<_>);

    // Run 1: ten days stale -> OPEN.
    let stats = run_once(&engine, "run-1", 10).await;
    assert_eq!(stats.opened, 1);
    assert_eq!(stats.resolved, 0);
    let instance = store.instance("def-stale", "JIRA-1").unwrap();
    assert_eq!(instance.status, SignalStatus::Open);
    assert_eq!(instance.source_run_id, "run-1");

    // Run 2: freshly updated -> no match -> RESOLVED.
    let stats = run_once(&engine, "run-2", 2).await;
    assert_eq!(stats.opened, 0);
    assert_eq!(stats.resolved, 1);
    assert_eq!(
        store.instance("def-stale", "JIRA-1").unwrap().status,
        SignalStatus::Resolved
    );

    // Run 3: stale again -> OPEN again under the same key.
    let stats = run_once(&engine, "run-3", 10).await;
    assert_eq!(stats.opened, 1);
    let instance = store.instance("def-stale", "JIRA-1").unwrap();
    assert_eq!(instance.status, SignalStatus::Open);
    assert_eq!(instance.source_run_id, "run-3");

    // Still exactly one instance for the (definition, entity) pair.
    assert_eq!(store.instance_count(), 1);
}

#[tokio::test]
async fn suppressed_instances_never_transition_automatically() {
    let store = Arc::new(MemorySignalStore::new());
    let graph = Arc::new(RecordingGraph::new());
    store.upsert_definition(&stale_definition()).await.unwrap();

    // Pre-existing suppression.
    store
        .upsert_instance(&SignalInstance {
            definition_id: "def-stale".to_string(),
            entity_ref: "JIRA-1".to_string(),
            entity_kind: "work_item".to_string(),
            severity: SignalSeverity::Info,
            status: SignalStatus::Suppressed,
            summary: "suppressed by operator".to_string(),
            details: Default::default(),
            source_run_id: "run-0".to_string(),
        })
        .await
        .unwrap();

    let engine = SignalEngine::new(store.clone() as Arc<_>, graph as Arc<_>);

    // A matching record keeps the suppression in place.
    let stats = run_once(&engine, "run-1", 30).await;
    assert_eq!(stats.suppressed_kept, 1);
    assert_eq!(stats.opened, 0);
    assert_eq!(
        store.instance("def-stale", "JIRA-1").unwrap().status,
        SignalStatus::Suppressed
    );

    // A non-matching record does not resolve it either.
    let stats = run_once(&engine, "run-2", 1).await;
    assert_eq!(stats.resolved, 0);
    assert_eq!(
        store.instance("def-stale", "JIRA-1").unwrap().status,
        SignalStatus::Suppressed
    );
}

#[tokio::test]
async fn signal_emission_writes_node_and_both_edges() {
    let store = Arc::new(MemorySignalStore::new());
    let graph = Arc::new(RecordingGraph::new());
    store.upsert_definition(&stale_definition()).await.unwrap();

    let engine = SignalEngine::new(store as Arc<_>, graph.clone() as Arc<_>);
    run_once(&engine, "run-1", 12).await;

    assert!(graph
        .node_ids()
        .contains(&"signal:def-stale:JIRA-1".to_string()));
    assert_eq!(graph.edges_of_type("instance_of").len(), 1);
    let flags = graph.edges_of_type("flags");
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].to_id, "JIRA-1");
}

#[tokio::test]
async fn definitions_for_other_entity_kinds_do_not_fire() {
    let store = Arc::new(MemorySignalStore::new());
    let graph = Arc::new(RecordingGraph::new());

    let mut definition = stale_definition();
    definition.entity_kind = "document".to_string();
    store.upsert_definition(&definition).await.unwrap();

    let engine = SignalEngine::new(store.clone() as Arc<_>, graph as Arc<_>);
    let stats = run_once(&engine, "run-1", 30).await;
    assert_eq!(stats.evaluated, 0);
    assert_eq!(stats.opened, 0);
    assert!(store.instance("def-stale", "JIRA-1").is_none());
}
