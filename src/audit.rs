//! Audit trail for operator actions.
//!
//! Manual settlement, cashout, issue resolution and balance adjustments all
//! record who did what, why, and the target's state before and after.

use crate::types::{ActorId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ForceSettle,
    CashOut,
    ResolveIssue,
    ReleaseHalt,
    AdjustBalance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor_id: ActorId,
    pub action: AuditAction,
    /// Bet id, issue id or account id, rendered as text.
    pub target_id: String,
    pub data_before: Value,
    pub data_after: Value,
    pub reason: String,
    pub recorded_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit log rejected entry: {0}")]
    Rejected(String),
}

pub trait AuditLog: Send + Sync {
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn for_target(&self, target_id: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.target_id == target_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditLog for InMemoryAuditLog {
    fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        if entry.reason.trim().is_empty() {
            return Err(AuditError::Rejected("empty reason".to_string()));
        }
        self.entries.lock().push(entry);
        Ok(())
    }
}
