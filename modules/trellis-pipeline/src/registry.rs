//! Artifact registry client: status lifecycle and counters for
//! `materialized_artifacts` in the external Postgres registry.
//!
//! Every write here is best-effort; a registry outage must never fail
//! the pipeline, so failures log a warning and move on.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArtifactRow {
    pub id: String,
    pub status: String,
    pub counters: Option<serde_json::Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Typed view of the counters JSON on an artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub artifact_id: String,
    pub status: String,
    pub records_staged: u64,
    pub entries_indexed: u64,
    pub clusters: u64,
    pub cache_hits: u64,
    pub version_hash: Option<String>,
    pub log_events_path: Option<String>,
}

/// Outcome of comparing two run summaries.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryDiff {
    /// Decided by `versionHash` equality alone; counter-only drift does
    /// not flip this.
    pub version_equal: bool,
    /// On mismatch, the right side's events path for replay.
    pub replay_events_path: Option<String>,
}

#[derive(Clone)]
pub struct ArtifactRegistry {
    pool: PgPool,
}

impl ArtifactRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn mark_indexing(&self, artifact_id: &str) {
        let result = sqlx::query(
            r#"
            UPDATE materialized_artifacts
            SET status = 'INDEXING', updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(artifact_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(artifact_id, error = %e, "Failed to mark artifact INDEXING");
        }
    }

    pub async fn mark_indexed(&self, artifact_id: &str, counters: &serde_json::Value) {
        let result = sqlx::query(
            r#"
            UPDATE materialized_artifacts
            SET status = 'INDEXED', counters = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(artifact_id)
        .bind(counters)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(artifact_id, error = %e, "Failed to mark artifact INDEXED");
        }
    }

    /// Records the first fatal error only; later failures keep the
    /// original message.
    pub async fn mark_index_failed(&self, artifact_id: &str, error: &str) {
        let result = sqlx::query(
            r#"
            UPDATE materialized_artifacts
            SET status = 'FAILED', error = COALESCE(error, $2), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(artifact_id)
        .bind(error)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(artifact_id, error = %e, "Failed to mark artifact FAILED");
        }
    }

    /// Merge clustering counters into the existing counters JSONB.
    pub async fn mark_clustered(&self, artifact_id: &str, counters: &serde_json::Value) {
        let result = sqlx::query(
            r#"
            UPDATE materialized_artifacts
            SET counters = COALESCE(counters, '{}'::jsonb) || $2::jsonb, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(artifact_id)
        .bind(counters)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(artifact_id, error = %e, "Failed to merge cluster counters");
        }
    }

    pub async fn get_artifact(&self, artifact_id: &str) -> anyhow::Result<Option<ArtifactRow>> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT id, status, counters, error, updated_at
            FROM materialized_artifacts
            WHERE id = $1
            "#,
        )
        .bind(artifact_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_run_summary(&self, artifact_id: &str) -> anyhow::Result<Option<RunSummary>> {
        Ok(self.get_artifact(artifact_id).await?.map(decode_summary))
    }

    /// Compare two artifacts by `versionHash`. On mismatch, return the
    /// right side's events path so the caller can replay it.
    pub async fn diff_run_summaries(
        &self,
        left_id: &str,
        right_id: &str,
    ) -> anyhow::Result<SummaryDiff> {
        let left = self.get_run_summary(left_id).await?;
        let right = self.get_run_summary(right_id).await?;
        Ok(diff_summaries(left.as_ref(), right.as_ref()))
    }
}

pub(crate) fn decode_summary(row: ArtifactRow) -> RunSummary {
    let counters = row.counters.unwrap_or(serde_json::Value::Null);
    let get_u64 = |key: &str| counters.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    let get_str = |key: &str| {
        counters
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    RunSummary {
        artifact_id: row.id,
        status: row.status,
        records_staged: get_u64("recordsStaged"),
        entries_indexed: get_u64("entriesIndexed"),
        clusters: get_u64("clusters"),
        cache_hits: get_u64("cacheHits"),
        version_hash: get_str("versionHash"),
        log_events_path: get_str("logEventsPath"),
    }
}

pub(crate) fn diff_summaries(left: Option<&RunSummary>, right: Option<&RunSummary>) -> SummaryDiff {
    let version_equal = match (left, right) {
        (Some(l), Some(r)) => l.version_hash.is_some() && l.version_hash == r.version_hash,
        _ => false,
    };
    SummaryDiff {
        version_equal,
        replay_events_path: if version_equal {
            None
        } else {
            right.and_then(|r| r.log_events_path.clone())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(counters: serde_json::Value) -> ArtifactRow {
        ArtifactRow {
            id: "a-1".to_string(),
            status: "INDEXED".to_string(),
            counters: Some(counters),
            error: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn summary_decodes_counters() {
        let summary = decode_summary(row(serde_json::json!({
            "recordsStaged": 120,
            "entriesIndexed": 100,
            "clusters": 7,
            "cacheHits": 5,
            "versionHash": "abc",
            "logEventsPath": "logs/kb/run-1/x.events.jsonl"
        })));
        assert_eq!(summary.records_staged, 120);
        assert_eq!(summary.entries_indexed, 100);
        assert_eq!(summary.clusters, 7);
        assert_eq!(summary.cache_hits, 5);
        assert_eq!(summary.version_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn summary_tolerates_missing_counters() {
        let mut r = row(serde_json::Value::Null);
        r.counters = None;
        let summary = decode_summary(r);
        assert_eq!(summary.records_staged, 0);
        assert!(summary.version_hash.is_none());
    }

    #[test]
    fn diff_matches_on_version_hash_only() {
        let mut left = decode_summary(row(serde_json::json!({
            "versionHash": "v1", "cacheHits": 1, "logEventsPath": "left.jsonl"
        })));
        let mut right = decode_summary(row(serde_json::json!({
            "versionHash": "v1", "cacheHits": 99, "logEventsPath": "right.jsonl"
        })));

        // Counter-only drift: still equal.
        let diff = diff_summaries(Some(&left), Some(&right));
        assert!(diff.version_equal);
        assert!(diff.replay_events_path.is_none());

        right.version_hash = Some("v2".to_string());
        let diff = diff_summaries(Some(&left), Some(&right));
        assert!(!diff.version_equal);
        assert_eq!(diff.replay_events_path.as_deref(), Some("right.jsonl"));

        left.version_hash = None;
        let diff = diff_summaries(Some(&left), Some(&right));
        assert!(!diff.version_equal);
    }

    #[test]
    fn diff_with_missing_side_is_unequal() {
        let right = decode_summary(row(serde_json::json!({"logEventsPath": "r.jsonl"})));
        let diff = diff_summaries(None, Some(&right));
        assert!(!diff.version_equal);
        assert_eq!(diff.replay_events_path.as_deref(), Some("r.jsonl"));
    }
}
