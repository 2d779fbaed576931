use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

/// One state-changing operation, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub actor: Ulid,
    pub action: &'static str,
    pub target_type: &'static str,
    pub target_id: Option<Ulid>,
    pub success: bool,
    pub reason: Option<String>,
    pub diff: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
#[error("audit sink unavailable: {0}")]
pub struct AuditError(pub String);

/// Audit log collaborator. Callers treat it as best-effort: an error here is
/// logged and never changes the outcome of the audited operation.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let diff = event.diff.as_ref().map(|d| d.to_string());
        tracing::info!(
            target: "audit",
            actor = %event.actor,
            action = event.action,
            target_type = event.target_type,
            target_id = ?event.target_id,
            success = event.success,
            reason = event.reason.as_deref(),
            diff = diff.as_deref(),
        );
        Ok(())
    }
}

/// Keeps every event in memory, for tests and embedders that ship audits elsewhere.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn actions(&self) -> Vec<(&'static str, bool)> {
        self.events().iter().map(|e| (e.action, e.success)).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}
