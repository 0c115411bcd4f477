//! Indexer content-hash dedup: two runs over identical staged content:
//! the first embeds and upserts everything, the second embeds nothing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use trellis_common::{RecordEnvelope, Scope};
use trellis_endpoint::Registries;
use trellis_pipeline::testing::{
    envelope, test_scope, FixedEmbedder, MemoryKv, MemoryVectorStore, TEST_EMBEDDING_DIM,
};
use trellis_pipeline::{IndexRequest, IndexSource, Indexer};
use trellis_store::{CheckpointEngine, MemoryStagingProvider, StagingRegistry};

struct Fixture {
    kv: Arc<MemoryKv>,
    vectors: Arc<MemoryVectorStore>,
    embedder: Arc<FixedEmbedder>,
    staging: Arc<StagingRegistry>,
    scope: Scope,
    indexer: Indexer,
}

fn fixture() -> Fixture {
    let kv = Arc::new(MemoryKv::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let embedder = Arc::new(FixedEmbedder::new(TEST_EMBEDDING_DIM));
    let staging = Arc::new(StagingRegistry::new());
    staging.register(Arc::new(MemoryStagingProvider::new(1024 * 1024)));
    let registries = Arc::new(Registries::new());
    let checkpoints = Arc::new(CheckpointEngine::new(kv.clone() as Arc<_>, None));
    let scope = test_scope();

    let indexer = Indexer::new(
        kv.clone() as Arc<_>,
        vectors.clone() as Arc<_>,
        embedder.clone() as Arc<_>,
        Arc::clone(&staging),
        registries,
        checkpoints,
        None,
        scope.clone(),
    );

    Fixture {
        kv,
        vectors,
        embedder,
        staging,
        scope,
        indexer,
    }
}

fn issues() -> Vec<RecordEnvelope> {
    vec![
        envelope("jira", "work_item", serde_json::json!({
            "id": "JIRA-1", "title": "Fix login", "description": "Session expires early"
        })),
        envelope("jira", "work_item", serde_json::json!({
            "id": "JIRA-2", "title": "Upgrade database", "description": "Postgres 16"
        })),
        envelope("jira", "work_item", serde_json::json!({
            "id": "JIRA-3", "title": "Add audit log", "description": "KB events"
        })),
    ]
}

async fn stage(fixture: &Fixture, envelopes: &[RecordEnvelope]) -> IndexSource {
    let provider = fixture.staging.get("memory").unwrap();
    let put = provider
        .put_batch("dedup-stage", "slice-0", 0, envelopes)
        .await
        .unwrap();
    IndexSource::Staged {
        stage_ref: put.stage_ref,
        batch_refs: vec![put.batch_ref],
    }
}

#[tokio::test]
async fn unchanged_content_skips_embedding_entirely() {
    let fixture = fixture();
    let envelopes = issues();

    // First run: everything embeds and upserts, hashes are saved.
    let source = stage(&fixture, &envelopes).await;
    let stats = fixture
        .indexer
        .index_run(
            IndexRequest {
                profile_id: None,
                dataset_id: "jira:issues".to_string(),
                artifact_id: "artifact-1".to_string(),
                run_id: "run-1".to_string(),
                source,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stats.records_seen, 3);
    assert_eq!(stats.embeddings_requested, 3);
    assert_eq!(stats.entries_indexed, 3);
    assert_eq!(stats.skipped_unchanged, 0);
    assert_eq!(fixture.embedder.embedded_count(), 3);
    assert_eq!(fixture.vectors.upserted_count(), 3);

    // Second run over identical content: zero embeddings, zero upserts.
    let source = stage(&fixture, &envelopes).await;
    let stats = fixture
        .indexer
        .index_run(
            IndexRequest {
                profile_id: None,
                dataset_id: "jira:issues".to_string(),
                artifact_id: "artifact-1".to_string(),
                run_id: "run-2".to_string(),
                source,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stats.records_seen, 3);
    assert_eq!(stats.embeddings_requested, 0);
    assert_eq!(stats.entries_indexed, 0);
    assert_eq!(stats.skipped_unchanged, 3);
    assert_eq!(fixture.embedder.embedded_count(), 3, "no new embedding calls");
    assert_eq!(fixture.vectors.upserted_count(), 3, "no new upserts");
}

#[tokio::test]
async fn changed_content_re_embeds_only_the_changed_record() {
    let fixture = fixture();
    let mut envelopes = issues();

    let source = stage(&fixture, &envelopes).await;
    fixture
        .indexer
        .index_run(
            IndexRequest {
                profile_id: None,
                dataset_id: "jira:issues".to_string(),
                artifact_id: "artifact-1".to_string(),
                run_id: "run-1".to_string(),
                source,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // Change one description; only that record should re-embed.
    envelopes[1]
        .payload
        .insert("description".to_string(), serde_json::json!("Postgres 17"));
    let source = stage(&fixture, &envelopes).await;
    let stats = fixture
        .indexer
        .index_run(
            IndexRequest {
                profile_id: None,
                dataset_id: "jira:issues".to_string(),
                artifact_id: "artifact-1".to_string(),
                run_id: "run-2".to_string(),
                source,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stats.embeddings_requested, 1);
    assert_eq!(stats.skipped_unchanged, 2);
    assert_eq!(fixture.embedder.embedded_count(), 4);
}

#[tokio::test]
async fn records_missing_required_fields_are_gated_out() {
    let fixture = fixture();
    let envelopes = vec![
        envelope("jira", "work_item", serde_json::json!({"id": "JIRA-9"})),
        envelope("jira", "work_item", serde_json::json!({
            "id": "JIRA-10", "title": "Has a title"
        })),
    ];

    let source = stage(&fixture, &envelopes).await;
    let stats = fixture
        .indexer
        .index_run(
            IndexRequest {
                profile_id: None,
                dataset_id: "jira:issues".to_string(),
                artifact_id: "artifact-1".to_string(),
                run_id: "run-1".to_string(),
                source,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stats.skipped_missing, 1);
    assert_eq!(stats.entries_indexed, 1);
    assert!(fixture.vectors.entry("JIRA-10").is_some());
    assert!(fixture.vectors.entry("JIRA-9").is_none());
}

#[tokio::test]
async fn checkpoint_records_last_batch_position() {
    let fixture = fixture();
    let envelopes = issues();

    let source = stage(&fixture, &envelopes).await;
    fixture
        .indexer
        .index_run(
            IndexRequest {
                profile_id: None,
                dataset_id: "jira:issues".to_string(),
                artifact_id: "artifact-1".to_string(),
                run_id: "run-1".to_string(),
                source,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let value = fixture
        .kv
        .value(&fixture.scope, "indexer:cdm.work_item.v1:jira-issues")
        .expect("indexer checkpoint saved");
    assert_eq!(value["batchRef"], "slice-0/00000000");
    assert_eq!(value["recordOffset"], 3);
    assert_eq!(value["lastRunId"], "run-1");
}
