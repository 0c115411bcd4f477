//! Checkpoint engine: durable per-(profile, dataset) cursors in the KV
//! store, with flattening of legacy nested cursors, CAS-versioned saves,
//! and history snapshots archived to the log store.
//!
//! Legacy data nests checkpoints under `cursor` keys; towers 35+ levels
//! deep exist in the wild. `normalize_for_read` lifts the terminal
//! watermark to the top level and never writes a cursor-of-cursor back.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use tracing::warn;

use trellis_common::{Checkpoint, Cursor, KvStore, PutOutcome, Record, Scope};

use crate::logstore::LogStore;

/// Descent stops past this depth; a watermark buried deeper stays where
/// it is and the checkpoint is returned unchanged.
const MAX_CURSOR_DEPTH: usize = 100;

const MAX_CAS_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Key shapes
// ---------------------------------------------------------------------------

pub fn indexer_key(profile_id: &str, dataset_slug: &str) -> String {
    format!("indexer:{profile_id}:{dataset_slug}")
}

pub fn cluster_key(dataset_slug: &str) -> String {
    format!("cluster:{dataset_slug}")
}

pub fn insight_key(skill_id: &str, entity_ref: &str) -> String {
    format!("insight:{skill_id}:{entity_ref}")
}

pub fn embed_key(profile_id: &str, node_id: &str) -> String {
    format!("embed:{profile_id}:{node_id}")
}

/// Make a checkpoint key safe for snapshot object paths: `::` becomes `/`,
/// spaces become `_`.
pub fn sanitize_key(key: &str) -> String {
    key.replace("::", "/").replace(' ', "_")
}

// ---------------------------------------------------------------------------
// Cursor flattening
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Preserved {
    last_run_at: Option<DateTime<Utc>>,
    last_run_id: Option<String>,
    record_count: Option<u64>,
    data_mode: Option<String>,
}

impl Preserved {
    /// First occurrence wins: the outermost level of a legacy tower is the
    /// most recently written.
    fn collect(&mut self, map: &Record) {
        if self.last_run_at.is_none() {
            self.last_run_at = map
                .get("lastRunAt")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
        }
        if self.last_run_id.is_none() {
            self.last_run_id = map
                .get("lastRunId")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
        if self.record_count.is_none() {
            self.record_count = map.get("recordCount").and_then(|v| v.as_u64());
        }
        if self.data_mode.is_none() {
            self.data_mode = map
                .get("dataMode")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
    }
}

struct Descent {
    watermark: Option<String>,
    preserved: Preserved,
    /// The innermost map, stripped of nothing, kept when no watermark
    /// could be lifted during a merge flatten.
    terminal_map: Option<Record>,
}

/// Walk a legacy cursor tower. A map descends via its `cursor` key; a
/// scalar terminates. The deepest non-empty `watermark` wins; a terminal
/// scalar is itself the watermark when no map supplied one.
fn descend(cursor: &Cursor) -> Descent {
    let mut result = Descent {
        watermark: None,
        preserved: Preserved::default(),
        terminal_map: None,
    };

    let mut current: Record = match cursor {
        Cursor::Scalar(s) => {
            if !s.is_empty() {
                result.watermark = Some(s.clone());
            }
            return result;
        }
        Cursor::Legacy(map) => map.clone(),
        Cursor::Opaque(_) => return result,
    };

    for _ in 0..MAX_CURSOR_DEPTH {
        result.preserved.collect(&current);
        if let Some(w) = current.get("watermark").and_then(|v| v.as_str()) {
            if !w.is_empty() {
                result.watermark = Some(w.to_string());
            }
        }

        match current.get("cursor") {
            Some(serde_json::Value::Object(inner)) => {
                current = inner.clone();
            }
            Some(serde_json::Value::String(s)) => {
                if result.watermark.is_none() && !s.is_empty() {
                    result.watermark = Some(s.clone());
                }
                result.terminal_map = Some(current);
                return result;
            }
            _ => {
                result.terminal_map = Some(current);
                return result;
            }
        }
    }

    // Depth cap reached; treat as unliftable.
    result.watermark = None;
    result
}

/// Flatten an arbitrarily deep legacy cursor. If a non-empty `watermark`
/// is already present at the top level the checkpoint is returned as-is;
/// if no watermark can be found at any depth the input is returned
/// unchanged. Idempotent.
pub fn normalize_for_read(cp: &Checkpoint) -> Checkpoint {
    if cp.effective_watermark().is_some() {
        return cp.clone();
    }
    let Some(cursor) = &cp.cursor else {
        return cp.clone();
    };

    let descent = descend(cursor);
    let Some(watermark) = descent.watermark else {
        return cp.clone();
    };

    let mut out = cp.clone();
    out.watermark = Some(watermark.clone());
    out.cursor = Some(Cursor::Scalar(watermark));
    // Top-level values win over anything found on the descent.
    out.last_run_at = cp.last_run_at.or(descent.preserved.last_run_at);
    out.last_run_id = cp.last_run_id.clone().or(descent.preserved.last_run_id);
    out.record_count = cp.record_count.or(descent.preserved.record_count);
    out.data_mode = cp.data_mode.clone().or(descent.preserved.data_mode);
    out
}

/// Shallow merge of `updates` onto `base`, then cursor flattening: a
/// flattened cursor map carrying a watermark has the watermark lifted, and
/// a cursor-of-cursor is never retained. `last_run_at` is monotonic: the
/// merged value never moves backwards.
pub fn merge(base: &Checkpoint, updates: &Checkpoint) -> Checkpoint {
    let mut merged = base.clone();

    if updates.watermark.is_some() {
        merged.watermark = updates.watermark.clone();
    }
    if updates.cursor.is_some() {
        merged.cursor = updates.cursor.clone();
    }
    merged.last_run_at = match (base.last_run_at, updates.last_run_at) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => b.or(a),
    };
    if updates.last_run_id.is_some() {
        merged.last_run_id = updates.last_run_id.clone();
    }
    if updates.record_count.is_some() {
        merged.record_count = updates.record_count;
    }
    if updates.data_mode.is_some() {
        merged.data_mode = updates.data_mode.clone();
    }
    for (key, value) in &updates.extra {
        merged.extra.insert(key.clone(), value.clone());
    }

    flatten_cursor(&mut merged);
    merged
}

fn flatten_cursor(cp: &mut Checkpoint) {
    let Some(Cursor::Legacy(map)) = &cp.cursor else {
        return;
    };

    let descent = descend(&Cursor::Legacy(map.clone()));
    match descent.watermark {
        Some(watermark) => {
            cp.watermark = Some(watermark.clone());
            cp.cursor = Some(Cursor::Scalar(watermark));
        }
        None => {
            // No watermark to lift; keep the innermost map so no
            // cursor-of-cursor survives.
            if let Some(terminal) = descent.terminal_map {
                cp.cursor = Some(Cursor::Legacy(terminal));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct CheckpointEngine {
    kv: Arc<dyn KvStore>,
    log: Option<LogStore>,
}

impl CheckpointEngine {
    pub fn new(kv: Arc<dyn KvStore>, log: Option<LogStore>) -> Self {
        Self { kv, log }
    }

    pub async fn load(&self, scope: &Scope, key: &str) -> Result<Option<Checkpoint>> {
        Ok(self.load_versioned(scope, key).await?.map(|(cp, _)| cp))
    }

    pub async fn load_versioned(
        &self,
        scope: &Scope,
        key: &str,
    ) -> Result<Option<(Checkpoint, u64)>> {
        let Some(stored) = self.kv.get(scope, key).await? else {
            return Ok(None);
        };
        let cp: Checkpoint = serde_json::from_value(stored.value)
            .with_context(|| format!("decoding checkpoint {key}"))?;
        Ok(Some((cp, stored.version)))
    }

    /// Merge `updates` onto the stored checkpoint and write with CAS.
    /// Conflicts re-read and re-merge, bounded by a retry cap. Each
    /// winning write archives a history snapshot (best-effort).
    pub async fn save(&self, scope: &Scope, key: &str, updates: &Checkpoint) -> Result<u64> {
        for _attempt in 0..MAX_CAS_RETRIES {
            let (base, expected) = match self.kv.get(scope, key).await? {
                Some(stored) => {
                    let cp: Checkpoint = serde_json::from_value(stored.value)
                        .with_context(|| format!("decoding checkpoint {key}"))?;
                    (cp, Some(stored.version))
                }
                None => (Checkpoint::default(), None),
            };

            let merged = merge(&base, updates);
            let value = serde_json::to_value(&merged)?;

            match self.kv.put(scope, key, value, expected).await? {
                PutOutcome::Stored { version } => {
                    self.archive(key, &merged, version).await;
                    return Ok(version);
                }
                PutOutcome::Conflict { .. } => continue,
            }
        }
        bail!("checkpoint CAS retries exhausted for {key}")
    }

    /// Append a pre-update snapshot to the log store. Archival failures
    /// are swallowed; history is an observability aid, not a
    /// correctness dependency.
    async fn archive(&self, key: &str, cp: &Checkpoint, version: u64) {
        let Some(log) = &self.log else {
            return;
        };
        let rel_path = format!("checkpoints/{}-v{version}.snapshot.json", sanitize_key(key));
        let value = match serde_json::to_value(cp) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode checkpoint snapshot");
                return;
            }
        };
        if let Err(e) = log.put_json(&rel_path, &value).await {
            warn!(key, version, error = %e, "Failed to archive checkpoint snapshot");
        }
    }

    /// Prune archived snapshots past the retention window (default 30 days).
    pub async fn prune_history(&self, retention_days: i64) -> Result<u64> {
        match &self.log {
            Some(log) => log.prune("checkpoints", retention_days).await,
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use trellis_common::VersionedValue;

    // --- normalization ---

    fn cp_from(json: serde_json::Value) -> Checkpoint {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn normalize_is_identity_on_flat_checkpoints() {
        let cp = cp_from(serde_json::json!({
            "watermark": "2026-01-01T00:00:00Z",
            "cursor": "2026-01-01T00:00:00Z",
            "recordCount": 5
        }));
        assert_eq!(normalize_for_read(&cp), cp);
    }

    #[test]
    fn normalize_lifts_three_level_legacy_cursor() {
        let cp = cp_from(serde_json::json!({
            "cursor": {"cursor": {"cursor": {
                "watermark": "2025-12-15T12:36:06Z",
                "recordCount": 50
            }}}
        }));
        let normalized = normalize_for_read(&cp);
        assert_eq!(normalized.watermark.as_deref(), Some("2025-12-15T12:36:06Z"));
        assert_eq!(
            normalized.cursor.unwrap().as_scalar(),
            Some("2025-12-15T12:36:06Z")
        );
        assert_eq!(normalized.record_count, Some(50));
    }

    #[test]
    fn normalize_lifts_watermark_from_35_levels() {
        let mut inner = serde_json::json!({"watermark": "wm-deep"});
        for _ in 0..35 {
            inner = serde_json::json!({"cursor": inner});
        }
        let normalized = normalize_for_read(&cp_from(inner));
        assert_eq!(normalized.watermark.as_deref(), Some("wm-deep"));
        assert!(!normalized.cursor.unwrap().is_map());
    }

    #[test]
    fn normalize_is_idempotent() {
        let cp = cp_from(serde_json::json!({
            "cursor": {"cursor": {"watermark": "w1", "lastRunId": "run-3"}}
        }));
        let once = normalize_for_read(&cp);
        let twice = normalize_for_read(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_terminal_scalar_is_the_watermark() {
        let cp = cp_from(serde_json::json!({"cursor": "2026-02-02T00:00:00Z"}));
        let normalized = normalize_for_read(&cp);
        assert_eq!(normalized.watermark.as_deref(), Some("2026-02-02T00:00:00Z"));
    }

    #[test]
    fn normalize_without_watermark_returns_input_unchanged() {
        let cp = cp_from(serde_json::json!({"cursor": {"pageToken": "tok"}}));
        assert_eq!(normalize_for_read(&cp), cp);
    }

    #[test]
    fn normalize_stops_past_depth_cap() {
        let mut inner = serde_json::json!({"watermark": "too-deep"});
        for _ in 0..120 {
            inner = serde_json::json!({"cursor": inner});
        }
        let cp = cp_from(inner);
        assert_eq!(normalize_for_read(&cp), cp);
    }

    #[test]
    fn normalize_prefers_outer_preserved_fields() {
        let cp = cp_from(serde_json::json!({
            "cursor": {
                "recordCount": 90,
                "cursor": {"watermark": "w", "recordCount": 10}
            }
        }));
        let normalized = normalize_for_read(&cp);
        assert_eq!(normalized.record_count, Some(90));
    }

    // --- merge ---

    #[test]
    fn merge_with_empty_updates_is_identity() {
        let base = cp_from(serde_json::json!({
            "watermark": "w",
            "cursor": "w",
            "recordCount": 3,
            "pageToken": "tok"
        }));
        assert_eq!(merge(&base, &Checkpoint::default()), base);
    }

    #[test]
    fn merge_lifts_watermark_from_map_cursor() {
        let base = Checkpoint::default();
        let updates = cp_from(serde_json::json!({
            "cursor": {"watermark": "w-new", "pageToken": "t"}
        }));
        let merged = merge(&base, &updates);
        assert_eq!(merged.watermark.as_deref(), Some("w-new"));
        assert_eq!(merged.cursor.unwrap().as_scalar(), Some("w-new"));
    }

    #[test]
    fn merge_never_retains_cursor_of_cursor() {
        let base = Checkpoint::default();
        let updates = cp_from(serde_json::json!({
            "cursor": {"cursor": {"pageToken": "tok"}}
        }));
        let merged = merge(&base, &updates);
        match merged.cursor.unwrap() {
            Cursor::Legacy(map) => assert!(!map.contains_key("cursor")),
            other => panic!("expected terminal map, got {other:?}"),
        }
    }

    #[test]
    fn merge_last_run_at_is_monotonic() {
        let earlier = "2026-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let later = "2026-02-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let base = Checkpoint {
            last_run_at: Some(later),
            ..Default::default()
        };
        let updates = Checkpoint {
            last_run_at: Some(earlier),
            ..Default::default()
        };
        assert_eq!(merge(&base, &updates).last_run_at, Some(later));
        assert_eq!(merge(&updates, &base).last_run_at, Some(later));
    }

    // --- keys ---

    #[test]
    fn key_shapes() {
        assert_eq!(indexer_key("cdm.work_item.v1", "jira-issues"), "indexer:cdm.work_item.v1:jira-issues");
        assert_eq!(cluster_key("jira-issues"), "cluster:jira-issues");
        assert_eq!(insight_key("doc-insight.v1", "DOC-9"), "insight:doc-insight.v1:DOC-9");
        assert_eq!(embed_key("source.generic.v1", "n-1"), "embed:source.generic.v1:n-1");
    }

    #[test]
    fn sanitize_key_rules() {
        assert_eq!(sanitize_key("indexer::p::d"), "indexer/p/d");
        assert_eq!(sanitize_key("cluster:my dataset"), "cluster:my_dataset");
    }

    // --- engine CAS ---

    /// In-memory KV with versioned CAS, for engine tests.
    #[derive(Default)]
    struct MemoryKv {
        data: Mutex<HashMap<String, (serde_json::Value, u64)>>,
    }

    #[async_trait::async_trait]
    impl KvStore for MemoryKv {
        async fn get(&self, scope: &Scope, key: &str) -> Result<Option<VersionedValue>> {
            let data = self.data.lock().unwrap();
            Ok(data
                .get(&format!("{}/{}/{key}", scope.tenant_id, scope.project_id))
                .map(|(value, version)| VersionedValue {
                    value: value.clone(),
                    version: *version,
                }))
        }

        async fn put(
            &self,
            scope: &Scope,
            key: &str,
            value: serde_json::Value,
            expected_version: Option<u64>,
        ) -> Result<PutOutcome> {
            let mut data = self.data.lock().unwrap();
            let full_key = format!("{}/{}/{key}", scope.tenant_id, scope.project_id);
            let current = data.get(&full_key).map(|(_, v)| *v);
            match (expected_version, current) {
                (Some(expected), Some(actual)) if expected != actual => {
                    Ok(PutOutcome::Conflict {
                        current_version: actual,
                    })
                }
                _ => {
                    let next = current.unwrap_or(0) + 1;
                    data.insert(full_key, (value, next));
                    Ok(PutOutcome::Stored { version: next })
                }
            }
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let engine = CheckpointEngine::new(Arc::new(MemoryKv::default()), None);
        let scope = Scope::new("dev", "global");

        let updates = cp_from(serde_json::json!({"watermark": "w1", "recordCount": 2}));
        let v1 = engine.save(&scope, "indexer:p:d", &updates).await.unwrap();
        assert_eq!(v1, 1);

        let loaded = engine.load(&scope, "indexer:p:d").await.unwrap().unwrap();
        assert_eq!(loaded.watermark.as_deref(), Some("w1"));
        assert_eq!(loaded.record_count, Some(2));

        let v2 = engine
            .save(&scope, "indexer:p:d", &cp_from(serde_json::json!({"recordCount": 5})))
            .await
            .unwrap();
        assert_eq!(v2, 2);
        let loaded = engine.load(&scope, "indexer:p:d").await.unwrap().unwrap();
        // Merge keeps the prior watermark.
        assert_eq!(loaded.watermark.as_deref(), Some("w1"));
        assert_eq!(loaded.record_count, Some(5));
    }

    #[tokio::test]
    async fn save_merges_over_stored_state() {
        let kv = Arc::new(MemoryKv::default());
        let engine = CheckpointEngine::new(kv, None);
        let scope = Scope::new("dev", "global");

        engine
            .save(&scope, "k", &cp_from(serde_json::json!({"watermark": "w", "pageToken": "t1"})))
            .await
            .unwrap();
        engine
            .save(&scope, "k", &cp_from(serde_json::json!({"pageToken": "t2"})))
            .await
            .unwrap();

        let loaded = engine.load(&scope, "k").await.unwrap().unwrap();
        assert_eq!(loaded.watermark.as_deref(), Some("w"));
        assert_eq!(loaded.extra.get("pageToken").and_then(|v| v.as_str()), Some("t2"));
    }
}
