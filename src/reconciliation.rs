//! Reconciliation issues and the bookkeeping behind them.
//!
//! The engine decides *when* something is wrong; this module keeps the issue
//! log (at most one open issue per fixture and type) and remembers which
//! results were applied so a later change can be recognised as a mismatch.

use crate::bet::SelectionStatus;
use crate::feed::OutcomeFingerprint;
use crate::types::{ActorId, BetId, FixtureId, IssueId, MarketKey, OutcomeKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    MissingResult,
    DuplicateResult,
    Mismatch,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::MissingResult => "missing_result",
            IssueType::DuplicateResult => "duplicate_result",
            IssueType::Mismatch => "mismatch",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Severity of a missing result that has been outstanding for `elapsed_ms`.
/// `None` while still inside the grace period.
pub fn missing_result_severity(elapsed_ms: i64, threshold_ms: i64) -> Option<Severity> {
    if elapsed_ms < threshold_ms {
        None
    } else if elapsed_ms < threshold_ms.saturating_mul(2) {
        Some(Severity::Medium)
    } else {
        Some(Severity::High)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationIssue {
    pub id: IssueId,
    pub issue_type: IssueType,
    pub fixture_id: FixtureId,
    pub affected_bet_ids: Vec<BetId>,
    pub severity: Severity,
    pub detail: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
    pub resolved_by: Option<ActorId>,
    pub resolution_note: Option<String>,
}

impl ReconciliationIssue {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// What `IssueLog::raise` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueChange {
    Raised(ReconciliationIssue),
    /// An open issue already existed and its severity went up.
    Escalated(ReconciliationIssue),
    /// An open issue already existed; only its affected bets or detail were refreshed.
    Refreshed(ReconciliationIssue),
}

impl IssueChange {
    pub fn issue(&self) -> &ReconciliationIssue {
        match self {
            IssueChange::Raised(i) | IssueChange::Escalated(i) | IssueChange::Refreshed(i) => i,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssueError {
    #[error("issue {0} not found")]
    NotFound(IssueId),

    #[error("issue {0} is already resolved")]
    AlreadyResolved(IssueId),
}

#[derive(Debug, Default)]
pub struct IssueLog {
    next_id: u64,
    issues: BTreeMap<IssueId, ReconciliationIssue>,
    open: HashMap<(FixtureId, IssueType), IssueId>,
}

impl IssueLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an issue, or folds the observation into the open one for the same fixture and type.
    pub fn raise(
        &mut self,
        fixture_id: &FixtureId,
        issue_type: IssueType,
        severity: Severity,
        affected: &[BetId],
        detail: String,
        at: Timestamp,
    ) -> IssueChange {
        if let Some(issue) = self
            .open
            .get(&(fixture_id.clone(), issue_type))
            .and_then(|id| self.issues.get_mut(id))
        {
            let merged: BTreeSet<BetId> = issue.affected_bet_ids.iter().chain(affected).copied().collect();
            issue.affected_bet_ids = merged.into_iter().collect();
            issue.detail = detail;
            issue.updated_at = at;
            if severity > issue.severity {
                issue.severity = severity;
                return IssueChange::Escalated(issue.clone());
            }
            return IssueChange::Refreshed(issue.clone());
        }

        self.next_id += 1;
        let id = IssueId(self.next_id);
        let mut affected_bet_ids = affected.to_vec();
        affected_bet_ids.sort();
        affected_bet_ids.dedup();
        let issue = ReconciliationIssue {
            id,
            issue_type,
            fixture_id: fixture_id.clone(),
            affected_bet_ids,
            severity,
            detail,
            created_at: at,
            updated_at: at,
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
        };
        self.issues.insert(id, issue.clone());
        self.open.insert((fixture_id.clone(), issue_type), id);
        IssueChange::Raised(issue)
    }

    pub fn resolve(
        &mut self,
        id: IssueId,
        resolved_by: Option<ActorId>,
        note: &str,
        at: Timestamp,
    ) -> Result<ReconciliationIssue, IssueError> {
        let issue = self.issues.get_mut(&id).ok_or(IssueError::NotFound(id))?;
        if !issue.is_open() {
            return Err(IssueError::AlreadyResolved(id));
        }
        issue.resolved_at = Some(at);
        issue.updated_at = at;
        issue.resolved_by = resolved_by;
        issue.resolution_note = Some(note.to_string());
        let resolved = issue.clone();
        self.open.remove(&(resolved.fixture_id.clone(), resolved.issue_type));
        Ok(resolved)
    }

    /// Closes the open issue of this type for a fixture, if any. Used when a clean result turns up.
    pub fn resolve_open(
        &mut self,
        fixture_id: &FixtureId,
        issue_type: IssueType,
        note: &str,
        at: Timestamp,
    ) -> Option<ReconciliationIssue> {
        let id = *self.open.get(&(fixture_id.clone(), issue_type))?;
        self.resolve(id, None, note, at).ok()
    }

    pub fn get(&self, id: IssueId) -> Option<&ReconciliationIssue> {
        self.issues.get(&id)
    }

    pub fn open_issue(&self, fixture_id: &FixtureId, issue_type: IssueType) -> Option<&ReconciliationIssue> {
        self.open
            .get(&(fixture_id.clone(), issue_type))
            .and_then(|id| self.issues.get(id))
    }

    pub fn open_issues(&self) -> Vec<ReconciliationIssue> {
        self.issues.values().filter(|i| i.is_open()).cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn all(&self) -> Vec<ReconciliationIssue> {
        self.issues.values().cloned().collect()
    }
}

/// One outcome whose status changed after it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeDivergence {
    pub market_key: MarketKey,
    pub outcome_key: OutcomeKey,
    pub applied: SelectionStatus,
    pub fresh: SelectionStatus,
}

impl fmt::Display for OutcomeDivergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} applied {} now {}",
            self.market_key, self.outcome_key, self.applied, self.fresh
        )
    }
}

/// Outcomes present in both fingerprints with different statuses.
pub fn diverging_outcomes(applied: &OutcomeFingerprint, fresh: &OutcomeFingerprint) -> Vec<OutcomeDivergence> {
    applied
        .iter()
        .filter_map(|((market, outcome), applied_status)| {
            let fresh_status = fresh.get(&(market.clone(), outcome.clone()))?;
            (fresh_status != applied_status).then(|| OutcomeDivergence {
                market_key: market.clone(),
                outcome_key: outcome.clone(),
                applied: *applied_status,
                fresh: *fresh_status,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
struct AppliedResult {
    fingerprint: OutcomeFingerprint,
    applied_at: Timestamp,
}

/// Per-fixture memory: when we first saw pending bets waiting on it, and what we applied.
#[derive(Debug, Default)]
pub struct FixtureTracker {
    first_seen: HashMap<FixtureId, Timestamp>,
    applied: HashMap<FixtureId, AppliedResult>,
}

impl FixtureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns when the fixture was first observed waiting for a result.
    pub fn observe(&mut self, fixture_id: &FixtureId, now: Timestamp) -> Timestamp {
        *self.first_seen.entry(fixture_id.clone()).or_insert(now)
    }

    pub fn first_seen(&self, fixture_id: &FixtureId) -> Option<Timestamp> {
        self.first_seen.get(fixture_id).copied()
    }

    /// Merges newly applied outcomes. Outcomes already on record keep their first applied status.
    pub fn record_applied(&mut self, fixture_id: &FixtureId, fingerprint: &OutcomeFingerprint, at: Timestamp) {
        let entry = self.applied.entry(fixture_id.clone()).or_insert_with(|| AppliedResult {
            fingerprint: OutcomeFingerprint::new(),
            applied_at: at,
        });
        for (key, status) in fingerprint {
            entry.fingerprint.entry(key.clone()).or_insert(*status);
        }
        entry.applied_at = at;
    }

    pub fn applied(&self, fixture_id: &FixtureId) -> Option<&OutcomeFingerprint> {
        self.applied.get(fixture_id).map(|a| &a.fingerprint)
    }

    /// Fixtures whose applied result is still worth re-checking at `now`.
    pub fn watched_fixtures(&self, now: Timestamp, watch_ms: i64) -> Vec<FixtureId> {
        let mut fixtures: Vec<FixtureId> = self
            .applied
            .iter()
            .filter(|(_, a)| now.elapsed_since(a.applied_at) <= watch_ms)
            .map(|(f, _)| f.clone())
            .collect();
        fixtures.sort();
        fixtures
    }

    /// Drops the pending-since marker once nothing waits on the fixture.
    pub fn settled(&mut self, fixture_id: &FixtureId) {
        self.first_seen.remove(fixture_id);
    }

    /// Forgets applied results older than the watch window.
    pub fn prune(&mut self, now: Timestamp, watch_ms: i64) {
        self.applied.retain(|_, a| now.elapsed_since(a.applied_at) <= watch_ms);
    }
}
