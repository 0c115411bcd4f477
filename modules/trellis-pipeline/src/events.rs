//! Per-run KB event log: an in-memory buffer of audit records with
//! per-run monotonic sequence numbers, flushed to the object log store as
//! line-delimited JSON. Event hashes enable idempotent replay.

use chrono::Utc;
use tracing::warn;

use trellis_common::{sha1_hex, KbEvent, KbOp};
use trellis_store::LogStore;

pub struct KbEventLog {
    table: String,
    run_id: String,
    events: Vec<KbEvent>,
    seq: u64,
    /// Path of the last flushed events object.
    last_events_path: Option<String>,
}

impl KbEventLog {
    pub fn new(table: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            run_id: run_id.into(),
            events: Vec::new(),
            seq: 0,
            last_events_path: None,
        }
    }

    /// Record one upsert/delete. `content` feeds the dedup hash together
    /// with the operation and target id.
    pub fn record(&mut self, op: KbOp, kind: &str, id: &str, content: &str) -> u64 {
        let seq = self.seq;
        self.events.push(KbEvent {
            seq,
            run_id: self.run_id.clone(),
            op,
            kind: kind.to_string(),
            id: id.to_string(),
            hash: sha1_hex(&format!("{op}|{kind}|{id}|{content}")),
            at: Utc::now(),
        });
        self.seq += 1;
        seq
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[KbEvent] {
        &self.events
    }

    /// Path of the most recent flush, exposed to run summaries for diff
    /// replay.
    pub fn last_events_path(&self) -> Option<&str> {
        self.last_events_path.as_deref()
    }

    /// Flush buffered events to the log store. Best-effort: a failed write
    /// logs a warning, keeps the buffer, and the pipeline continues.
    pub async fn flush(&mut self, log: &LogStore) {
        if self.events.is_empty() {
            return;
        }
        match log.append_events(&self.table, &self.run_id, &self.events).await {
            Ok(path) => {
                self.last_events_path = Some(path);
                self.events.clear();
            }
            Err(e) => {
                warn!(
                    table = %self.table,
                    run_id = %self.run_id,
                    error = %e,
                    "Failed to flush KB events"
                );
            }
        }
    }

    /// Write the single per-run snapshot. Best-effort.
    pub async fn snapshot(&self, log: &LogStore, stats: &serde_json::Value) {
        if let Err(e) = log.write_snapshot(&self.table, &self.run_id, stats).await {
            warn!(
                table = %self.table,
                run_id = %self.run_id,
                error = %e,
                "Failed to write run snapshot"
            );
        }
    }
}
