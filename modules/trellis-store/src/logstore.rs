//! Object-storage log store: append-only KB event files and per-run
//! snapshots under `logs/`, with age-based pruning.
//!
//! Object stores have no append, so each flush becomes its own
//! `logs/<table>/<runId>/<ts>.events.jsonl` object; readers list the prefix
//! and concatenate in name order.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, info};

use trellis_common::KbEvent;

const LOGS_ROOT: &str = "logs";

#[derive(Clone)]
pub struct LogStore {
    store: Arc<dyn ObjectStore>,
}

impl LogStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Append a flush of KB events for a run. Returns the object path.
    pub async fn append_events(
        &self,
        table: &str,
        run_id: &str,
        events: &[KbEvent],
    ) -> Result<String> {
        let ts = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let path = Path::from(format!("{LOGS_ROOT}/{table}/{run_id}/{ts}.events.jsonl"));

        let mut body = Vec::new();
        for event in events {
            serde_json::to_writer(&mut body, event)?;
            body.push(b'\n');
        }

        self.store
            .put(&path, PutPayload::from(Bytes::from(body)))
            .await
            .with_context(|| format!("appending {} events to {path}", events.len()))?;

        debug!(table, run_id, count = events.len(), "KB events appended");
        Ok(path.to_string())
    }

    /// All KB events of a run, in append order.
    pub async fn read_events(&self, table: &str, run_id: &str) -> Result<Vec<KbEvent>> {
        let prefix = Path::from(format!("{LOGS_ROOT}/{table}/{run_id}"));
        let mut metas: Vec<object_store::ObjectMeta> =
            self.store.list(Some(&prefix)).try_collect().await?;
        metas.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));

        let mut events = Vec::new();
        for meta in metas {
            let bytes = self.store.get(&meta.location).await?.bytes().await?;
            for line in bytes.split(|b| *b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                let event: KbEvent = serde_json::from_slice(line)
                    .with_context(|| format!("corrupt event line in {}", meta.location))?;
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Write the single per-run snapshot: `logs/<table>/<runId>.snapshot.json`.
    pub async fn write_snapshot(
        &self,
        table: &str,
        run_id: &str,
        snapshot: &serde_json::Value,
    ) -> Result<String> {
        let path = Path::from(format!("{LOGS_ROOT}/{table}/{run_id}.snapshot.json"));
        self.store
            .put(&path, PutPayload::from(Bytes::from(serde_json::to_vec(snapshot)?)))
            .await
            .with_context(|| format!("writing snapshot {path}"))?;
        Ok(path.to_string())
    }

    /// Write arbitrary JSON under `logs/<rel_path>`. Used for checkpoint
    /// history snapshots.
    pub async fn put_json(&self, rel_path: &str, value: &serde_json::Value) -> Result<String> {
        let path = Path::from(format!("{LOGS_ROOT}/{rel_path}"));
        self.store
            .put(&path, PutPayload::from(Bytes::from(serde_json::to_vec(value)?)))
            .await
            .with_context(|| format!("writing {path}"))?;
        Ok(path.to_string())
    }

    pub async fn get_json(&self, rel_path: &str) -> Result<Option<serde_json::Value>> {
        let path = Path::from(format!("{LOGS_ROOT}/{rel_path}"));
        match self.store.get(&path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete objects under `logs/<table>/` older than the retention
    /// cutoff. `retention_days <= 0` disables pruning. Returns the number
    /// of deleted objects.
    pub async fn prune(&self, table: &str, retention_days: i64) -> Result<u64> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(retention_days);
        let prefix = Path::from(format!("{LOGS_ROOT}/{table}"));

        let metas: Vec<object_store::ObjectMeta> =
            self.store.list(Some(&prefix)).try_collect().await?;

        let mut deleted = 0u64;
        for meta in metas {
            if meta.last_modified < cutoff {
                self.store.delete(&meta.location).await?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(table, deleted, retention_days, "Pruned log store objects");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use object_store::memory::InMemory;
    use trellis_common::KbOp;

    fn store() -> LogStore {
        LogStore::new(Arc::new(InMemory::new()))
    }

    fn event(seq: u64) -> KbEvent {
        KbEvent {
            seq,
            run_id: "run-1".to_string(),
            op: KbOp::UpsertNode,
            kind: "signal".to_string(),
            id: format!("node-{seq}"),
            hash: format!("hash-{seq}"),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn events_round_trip_in_order() {
        let log = store();
        log.append_events("kb", "run-1", &[event(0), event(1)])
            .await
            .unwrap();
        log.append_events("kb", "run-1", &[event(2)]).await.unwrap();

        let events = log.read_events("kb", "run-1").await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn snapshot_path_shape() {
        let log = store();
        let path = log
            .write_snapshot("kb", "run-7", &serde_json::json!({"records": 3}))
            .await
            .unwrap();
        assert_eq!(path, "logs/kb/run-7.snapshot.json");
    }

    #[tokio::test]
    async fn prune_disabled_when_retention_non_positive() {
        let log = store();
        log.append_events("kb", "run-1", &[event(0)]).await.unwrap();
        assert_eq!(log.prune("kb", 0).await.unwrap(), 0);
        assert_eq!(log.prune("kb", -3).await.unwrap(), 0);
        assert_eq!(log.read_events("kb", "run-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_fresh_objects() {
        let log = store();
        log.append_events("kb", "run-1", &[event(0)]).await.unwrap();
        // Everything was just written; nothing is older than 30 days.
        assert_eq!(log.prune("kb", 30).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn put_get_json_round_trip() {
        let log = store();
        let value = serde_json::json!({"watermark": "2026-01-01T00:00:00Z"});
        let path = log
            .put_json("checkpoints/indexer:p:d-v3.snapshot.json", &value)
            .await
            .unwrap();
        assert!(path.starts_with("logs/checkpoints/"));
        let back = log
            .get_json("checkpoints/indexer:p:d-v3.snapshot.json")
            .await
            .unwrap();
        assert_eq!(back, Some(value));
    }
}
