//! Operation manager: the durable state machine around a pipeline run.
//! `QUEUED → RUNNING → {SUCCEEDED, FAILED}`, idempotency-keyed starts,
//! and message-based error classification into the coded error space.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use trellis_common::{ErrorCode, ErrorDetail, OperationStats, OperationStatus, TrellisError};

#[derive(Debug, Clone)]
pub struct OperationSnapshot {
    pub operation_id: String,
    pub kind: String,
    pub status: OperationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: OperationStats,
    pub error: Option<ErrorDetail>,
    /// True until the first slice commits. Afterwards failures are
    /// reported non-retryable; an observability hint, not enforcement.
    pub retryable_phase: bool,
}

#[derive(Default)]
struct Inner {
    operations: HashMap<String, OperationSnapshot>,
    idempotency: HashMap<String, String>,
}

#[derive(Default)]
pub struct OperationManager {
    inner: Mutex<Inner>,
}

impl OperationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or re-observe) an operation. A repeated start with the same
    /// idempotency key returns the existing operation id.
    pub fn start(&self, kind: &str, idempotency_key: &str) -> (String, bool) {
        let mut inner = self.inner.lock().expect("operation manager poisoned");

        if !idempotency_key.is_empty() {
            if let Some(existing) = inner.idempotency.get(idempotency_key) {
                return (existing.clone(), false);
            }
        }

        let operation_id = Uuid::new_v4().to_string();
        inner.operations.insert(
            operation_id.clone(),
            OperationSnapshot {
                operation_id: operation_id.clone(),
                kind: kind.to_string(),
                status: OperationStatus::Queued,
                started_at: None,
                completed_at: None,
                stats: OperationStats::default(),
                error: None,
                retryable_phase: true,
            },
        );
        if !idempotency_key.is_empty() {
            inner
                .idempotency
                .insert(idempotency_key.to_string(), operation_id.clone());
        }
        (operation_id, true)
    }

    /// Non-blocking cloned snapshot.
    pub fn get(&self, operation_id: &str) -> Option<OperationSnapshot> {
        let inner = self.inner.lock().expect("operation manager poisoned");
        inner.operations.get(operation_id).cloned()
    }

    pub fn list(&self) -> Vec<OperationSnapshot> {
        let inner = self.inner.lock().expect("operation manager poisoned");
        let mut operations: Vec<OperationSnapshot> = inner.operations.values().cloned().collect();
        operations.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));
        operations
    }

    pub fn mark_running(&self, operation_id: &str) {
        self.update(operation_id, |op| {
            op.status = OperationStatus::Running;
            op.started_at = Some(Utc::now());
        });
    }

    pub fn update_stats(&self, operation_id: &str, f: impl FnOnce(&mut OperationStats)) {
        self.update(operation_id, |op| f(&mut op.stats));
    }

    /// A slice committed durable state; subsequent failures stop being
    /// reported retryable.
    pub fn note_slice_committed(&self, operation_id: &str) {
        self.update(operation_id, |op| {
            op.retryable_phase = false;
            op.stats.slices_done += 1;
        });
    }

    pub fn succeed(&self, operation_id: &str) {
        self.update(operation_id, |op| {
            op.status = OperationStatus::Succeeded;
            op.completed_at = Some(Utc::now());
        });
    }

    pub fn fail(&self, operation_id: &str, mut detail: ErrorDetail) {
        self.update(operation_id, |op| {
            detail.retryable = detail.retryable && op.retryable_phase;
            op.status = OperationStatus::Failed;
            op.completed_at = Some(Utc::now());
            op.error = Some(detail);
        });
    }

    fn update(&self, operation_id: &str, f: impl FnOnce(&mut OperationSnapshot)) {
        let mut inner = self.inner.lock().expect("operation manager poisoned");
        if let Some(op) = inner.operations.get_mut(operation_id) {
            f(op);
        }
    }
}

/// Classify a pipeline error into the coded error space. Typed errors
/// keep their own code; untyped errors are classified by message text.
pub fn classify_error(err: &TrellisError) -> ErrorDetail {
    match err {
        TrellisError::Anyhow(inner) => classify_message(&inner.to_string()),
        typed => typed.detail(),
    }
}

pub fn classify_message(message: &str) -> ErrorDetail {
    let lower = message.to_lowercase();
    let code = if lower.contains("deadline") || lower.contains("timeout") || lower.contains("timed out")
    {
        ErrorCode::Timeout
    } else if lower.contains("unreachable") {
        ErrorCode::EndpointUnreachable
    } else if lower.contains("auth") {
        ErrorCode::AuthInvalid
    } else {
        ErrorCode::Unknown
    };
    ErrorDetail::new(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_idempotent_per_key() {
        let manager = OperationManager::new();
        let (first, created_first) = manager.start("ingest", "key-1");
        let (second, created_second) = manager.start("ingest", "key-1");
        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first, second);

        let (third, _) = manager.start("ingest", "key-2");
        assert_ne!(first, third);
    }

    #[test]
    fn empty_idempotency_key_always_creates() {
        let manager = OperationManager::new();
        let (a, _) = manager.start("ingest", "");
        let (b, _) = manager.start("ingest", "");
        assert_ne!(a, b);
    }

    #[test]
    fn lifecycle_transitions() {
        let manager = OperationManager::new();
        let (id, _) = manager.start("ingest", "k");
        assert_eq!(manager.get(&id).unwrap().status, OperationStatus::Queued);

        manager.mark_running(&id);
        assert_eq!(manager.get(&id).unwrap().status, OperationStatus::Running);
        assert!(manager.get(&id).unwrap().started_at.is_some());

        manager.succeed(&id);
        let snapshot = manager.get(&id).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Succeeded);
        assert!(snapshot.completed_at.is_some());
    }

    #[test]
    fn failures_after_first_commit_are_not_retryable() {
        let manager = OperationManager::new();
        let (id, _) = manager.start("ingest", "k");
        manager.mark_running(&id);
        manager.note_slice_committed(&id);

        manager.fail(&id, ErrorDetail::new(ErrorCode::Timeout, "deadline exceeded"));
        let snapshot = manager.get(&id).unwrap();
        assert_eq!(snapshot.status, OperationStatus::Failed);
        let error = snapshot.error.unwrap();
        assert_eq!(error.code, ErrorCode::Timeout);
        assert!(!error.retryable);
    }

    #[test]
    fn failures_before_first_commit_keep_retryability() {
        let manager = OperationManager::new();
        let (id, _) = manager.start("ingest", "k");
        manager.mark_running(&id);
        manager.fail(&id, ErrorDetail::new(ErrorCode::Timeout, "deadline exceeded"));
        assert!(manager.get(&id).unwrap().error.unwrap().retryable);
    }

    #[test]
    fn message_classification() {
        assert_eq!(classify_message("deadline exceeded").code, ErrorCode::Timeout);
        assert!(classify_message("deadline exceeded").retryable);
        assert_eq!(
            classify_message("host unreachable").code,
            ErrorCode::EndpointUnreachable
        );
        assert_eq!(
            classify_message("authentication rejected").code,
            ErrorCode::AuthInvalid
        );
        assert!(!classify_message("authentication rejected").retryable);
        assert_eq!(classify_message("boom").code, ErrorCode::Unknown);
    }
}
