//! Reconciliation: compares the ledger with the result feed and records what
//! does not line up. Detects missing, conflicting and changed results; applies
//! clean results as they arrive.

use super::core::{snapshot, Engine};
use super::results::{ReconcileError, ReconcileReport, ResultState, SweepReport};
use crate::audit::AuditAction;
use crate::bet::BetRecord;
use crate::events::{EventPayload, IssueRaisedEvent, IssueResolvedEvent};
use crate::feed::FixtureResult;
use crate::reconciliation::{
    diverging_outcomes, missing_result_severity, IssueChange, IssueError, IssueType, ReconciliationIssue, Severity,
};
use crate::types::{ActorId, BetId, FixtureId, IssueId, MarketKey, OutcomeKey};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl Engine {
    /// One reconciliation pass over a single fixture.
    pub fn reconcile_fixture(&self, fixture_id: &FixtureId) -> Result<ReconcileReport, ReconcileError> {
        let now = self.now();
        let pending = self.ledger.pending_bets_for_fixture(fixture_id)?;
        let pending_ids: Vec<BetId> = pending.iter().map(|r| r.id()).collect();
        let mut report = ReconcileReport::new(fixture_id.clone(), pending.len());

        let fetched = match self.results.fixture_result(fixture_id) {
            Ok(result) => result,
            Err(e) => {
                warn!(fixture_id = %fixture_id, error = %e, "result feed lookup failed");
                report.result = ResultState::FeedError(e.to_string());
                None
            }
        };
        let final_result = match fetched {
            Some(result) if result.is_final() => {
                report.result = ResultState::Final;
                Some(result)
            }
            Some(_) => {
                report.result = ResultState::Provisional;
                None
            }
            None => None,
        };

        match final_result {
            None if !pending.is_empty() => {
                let first_seen = self.tracker.lock().observe(fixture_id, now);
                let waited = now.elapsed_since(first_seen);
                let threshold = self.config.reconciliation.missing_result_after_ms;
                if let Some(severity) = missing_result_severity(waited, threshold) {
                    let detail = format!("no final result {} ms after pending bets were first seen", waited);
                    self.raise(&mut report, IssueType::MissingResult, severity, &pending_ids, detail);
                }
            }
            None => {}
            Some(result) => {
                self.auto_resolve(&mut report, IssueType::MissingResult, "final result arrived");
                self.check_mismatch(&mut report, &result)?;
                self.check_conflicts(&mut report, &result, &pending);
                if !pending.is_empty() {
                    report.settlement = Some(self.apply_fixture_result(&result)?);
                }
            }
        }

        if self.ledger.pending_bets_for_fixture(fixture_id)?.is_empty() {
            self.tracker.lock().settled(fixture_id);
        }
        Ok(report)
    }

    /// Reconciles every fixture with pending bets plus every recently applied one.
    /// A failure on one fixture is recorded and the sweep moves on.
    pub fn reconcile_all(&self) -> Result<SweepReport, ReconcileError> {
        let now = self.now();
        let watch_ms = self.config.reconciliation.mismatch_watch_ms;

        let mut fixtures: BTreeSet<FixtureId> = self.ledger.pending_fixtures()?.into_iter().collect();
        fixtures.extend(self.tracker.lock().watched_fixtures(now, watch_ms));

        let mut sweep = SweepReport::default();
        for fixture_id in fixtures {
            match self.reconcile_fixture(&fixture_id) {
                Ok(report) => sweep.reports.push(report),
                Err(e) => {
                    warn!(fixture_id = %fixture_id, error = %e, "fixture reconciliation failed");
                    sweep.failures.push((fixture_id, e.to_string()));
                }
            }
        }
        self.tracker.lock().prune(now, watch_ms);

        info!(
            fixtures = sweep.reports.len() + sweep.failures.len(),
            issues_raised = sweep.issues_raised(),
            feed_errors = sweep.feed_errors(),
            failures = sweep.failures.len(),
            open_issues = self.issues.lock().open_count(),
            "reconciliation sweep finished"
        );
        Ok(sweep)
    }

    /// Operator closes an issue. Remediation itself goes through `force_settle`.
    pub fn resolve_issue(
        &self,
        issue_id: IssueId,
        actor: &ActorId,
        note: &str,
    ) -> Result<ReconciliationIssue, ReconcileError> {
        if note.trim().is_empty() {
            return Err(ReconcileError::MissingReason);
        }
        let before = self
            .issues
            .lock()
            .get(issue_id)
            .cloned()
            .ok_or(IssueError::NotFound(issue_id))?;
        let resolved = self
            .issues
            .lock()
            .resolve(issue_id, Some(actor.clone()), note, self.now())?;

        self.record_audit(
            actor,
            AuditAction::ResolveIssue,
            issue_id.to_string(),
            snapshot(&before),
            snapshot(&resolved),
            note,
        )?;
        self.emit(EventPayload::IssueResolved(IssueResolvedEvent {
            issue_id,
            fixture_id: resolved.fixture_id.clone(),
            issue_type: resolved.issue_type,
            resolved_by: resolved.resolved_by.clone(),
        }));
        info!(issue_id = %issue_id, actor = %actor, "issue resolved");
        Ok(resolved)
    }

    // 8.4: an outcome we already settled on now reads differently. the settlements stand.
    fn check_mismatch(&self, report: &mut ReconcileReport, result: &FixtureResult) -> Result<(), ReconcileError> {
        let applied = self.tracker.lock().applied(&result.fixture_id).cloned();
        let Some(applied) = applied else {
            return Ok(());
        };
        let divergences = diverging_outcomes(&applied, &result.fingerprint());
        if divergences.is_empty() {
            return Ok(());
        }

        let changed: BTreeSet<(MarketKey, OutcomeKey)> = divergences
            .iter()
            .map(|d| (d.market_key.clone(), d.outcome_key.clone()))
            .collect();
        let affected = self.bets_on_outcomes(&result.fixture_id, &changed)?;
        let detail = divergences
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        self.raise(report, IssueType::Mismatch, Severity::Critical, &affected, detail);
        Ok(())
    }

    // 8.5: the same outcome reported twice with different statuses
    fn check_conflicts(
        &self,
        report: &mut ReconcileReport,
        result: &FixtureResult,
        pending: &[BetRecord],
    ) {
        let conflicts = result.conflicts();
        if conflicts.is_empty() {
            self.auto_resolve(report, IssueType::DuplicateResult, "result no longer conflicting");
            return;
        }

        let conflicting: BTreeSet<(MarketKey, OutcomeKey)> = conflicts.into_iter().collect();
        let affected: Vec<BetId> = pending
            .iter()
            .filter(|r| {
                r.selections.iter().any(|s| {
                    s.fixture_id == result.fixture_id
                        && conflicting.contains(&(s.market_key.clone(), s.outcome_key.clone()))
                })
            })
            .map(|r| r.id())
            .collect();
        let detail = conflicting
            .iter()
            .map(|(m, o)| format!("{}/{}", m, o))
            .collect::<Vec<_>>()
            .join(", ");
        self.raise(
            report,
            IssueType::DuplicateResult,
            Severity::High,
            &affected,
            format!("conflicting statuses for {}", detail),
        );
    }

    fn bets_on_outcomes(
        &self,
        fixture_id: &FixtureId,
        outcomes: &BTreeSet<(MarketKey, OutcomeKey)>,
    ) -> Result<Vec<BetId>, ReconcileError> {
        // settled bets included: a mismatch is about results already paid out
        Ok(self
            .ledger
            .bets_for_fixture(fixture_id)?
            .iter()
            .filter(|r| {
                r.selections.iter().any(|s| {
                    &s.fixture_id == fixture_id
                        && outcomes.contains(&(s.market_key.clone(), s.outcome_key.clone()))
                })
            })
            .map(|r| r.id())
            .collect())
    }

    fn raise(
        &self,
        report: &mut ReconcileReport,
        issue_type: IssueType,
        severity: Severity,
        affected: &[BetId],
        detail: String,
    ) {
        let fixture_id = report.fixture_id.clone();
        let change = self
            .issues
            .lock()
            .raise(&fixture_id, issue_type, severity, affected, detail, self.now());

        let issue = match change {
            IssueChange::Refreshed(issue) => {
                debug!(issue_id = %issue.id, fixture_id = %fixture_id, issue_type = %issue_type, "issue still open");
                return;
            }
            IssueChange::Raised(issue) => {
                report.raised.push(issue.clone());
                issue
            }
            IssueChange::Escalated(issue) => {
                report.escalated.push(issue.clone());
                issue
            }
        };
        warn!(
            issue_id = %issue.id,
            fixture_id = %fixture_id,
            issue_type = %issue_type,
            severity = %issue.severity,
            affected_bets = issue.affected_bet_ids.len(),
            detail = %issue.detail,
            "reconciliation issue"
        );
        self.emit(EventPayload::IssueRaised(IssueRaisedEvent {
            issue_id: issue.id,
            fixture_id,
            issue_type,
            severity: issue.severity,
            affected_bets: issue.affected_bet_ids.len(),
        }));
    }

    fn auto_resolve(&self, report: &mut ReconcileReport, issue_type: IssueType, note: &str) {
        let resolved = self
            .issues
            .lock()
            .resolve_open(&report.fixture_id, issue_type, note, self.now());
        let Some(issue) = resolved else {
            return;
        };
        info!(issue_id = %issue.id, fixture_id = %issue.fixture_id, issue_type = %issue_type, "issue cleared");
        self.emit(EventPayload::IssueResolved(IssueResolvedEvent {
            issue_id: issue.id,
            fixture_id: issue.fixture_id.clone(),
            issue_type,
            resolved_by: None,
        }));
        report.resolved.push(issue);
    }
}
