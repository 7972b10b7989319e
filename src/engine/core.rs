// 8.0 engine/core.rs: main engine. holds the collaborators, the exposure book, events, issues.
// every method takes &self so one engine can be shared across threads behind an Arc.

use super::results::EngineError;
use crate::account::{Account, Transaction};
use crate::audit::{AuditAction, AuditEntry, AuditError, AuditLog};
use crate::bet::BetRecord;
use crate::config::WagerConfig;
use crate::events::{BalanceAdjustedEvent, Event, EventCollector, EventPayload, ExposureUpdatedEvent};
use crate::exposure::{ExposureBook, ExposureEntry, ExposureKey};
use crate::feed::{MarketService, ResultFeed};
use crate::reconciliation::{FixtureTracker, IssueLog, ReconciliationIssue};
use crate::store::{LedgerError, LedgerStore};
use crate::types::{AccountId, ActorId, BetId, Cents, Clock, FixtureId, IssueId, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, trace, warn};

/// Everything the engine talks to but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerStore>,
    pub results: Arc<dyn ResultFeed>,
    pub markets: Arc<dyn MarketService>,
    pub audit: Arc<dyn AuditLog>,
    pub clock: Arc<dyn Clock>,
}

/** 8.1: main engine struct. the ledger is the source of truth, everything else here is derived */
pub struct Engine {
    pub(super) config: WagerConfig,
    pub(super) ledger: Arc<dyn LedgerStore>,
    pub(super) results: Arc<dyn ResultFeed>,
    pub(super) markets: Arc<dyn MarketService>,
    pub(super) audit: Arc<dyn AuditLog>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) exposure: RwLock<ExposureBook>,
    pub(super) events: Mutex<EventCollector>,
    pub(super) issues: Mutex<IssueLog>,
    pub(super) tracker: Mutex<FixtureTracker>,
    // bets currently inside a settlement path
    pub(super) in_flight: Mutex<HashSet<BetId>>,
    // bets quarantined after an idempotency violation, with the reason
    pub(super) halted: Mutex<HashMap<BetId, String>>,
}

impl Engine {
    /// Validates the config and rebuilds exposure from the bets already pending in the ledger.
    pub fn new(config: WagerConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        config.validate()?;
        let pending = collaborators.ledger.pending_bets()?;
        let exposure = ExposureBook::rebuild(&pending)?;
        info!(
            pending_bets = pending.len(),
            total_liability = %exposure.total_liability(),
            "engine started"
        );

        Ok(Self {
            events: Mutex::new(EventCollector::with_capacity(config.max_events)),
            config,
            ledger: collaborators.ledger,
            results: collaborators.results,
            markets: collaborators.markets,
            audit: collaborators.audit,
            clock: collaborators.clock,
            exposure: RwLock::new(exposure),
            issues: Mutex::new(IssueLog::new()),
            tracker: Mutex::new(FixtureTracker::new()),
            in_flight: Mutex::new(HashSet::new()),
            halted: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &WagerConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn open_account(&self, opening_balance: Cents) -> Result<Account, EngineError> {
        let account = self.ledger.open_account(opening_balance, self.now())?;
        info!(account_id = %account.id, balance = %account.balance, "account opened");
        Ok(account)
    }

    pub fn account(&self, account_id: AccountId) -> Result<Option<Account>, EngineError> {
        Ok(self.ledger.account(account_id)?)
    }

    pub fn transactions(&self, account_id: AccountId) -> Result<Vec<Transaction>, EngineError> {
        Ok(self.ledger.transactions(account_id)?)
    }

    pub fn bet(&self, bet_id: BetId) -> Result<Option<BetRecord>, EngineError> {
        Ok(self.ledger.bet(bet_id)?)
    }

    /// Deposits, withdrawals and corrections. Operator initiated, so it is audited.
    /// With `expected_balance` set a stale balance fails with a conflict instead of being retried.
    pub fn adjust_balance(
        &self,
        account_id: AccountId,
        amount: Cents,
        expected_balance: Option<Cents>,
        reference: &str,
        actor: &ActorId,
        reason: &str,
    ) -> Result<Transaction, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::MissingReason);
        }
        let before = self
            .ledger
            .account(account_id)?
            .ok_or(LedgerError::AccountNotFound(account_id))?;

        let at = self.now();
        let tx = match expected_balance {
            Some(_) => self
                .ledger
                .adjust_balance(account_id, amount, expected_balance, reference, at)?,
            None => self.with_retry("adjust_balance", || {
                self.ledger.adjust_balance(account_id, amount, None, reference, at)
            })?,
        };

        self.record_audit(
            actor,
            AuditAction::AdjustBalance,
            account_id.to_string(),
            json!({ "balance": before.balance }),
            json!({ "balance": tx.balance_after, "transaction_id": tx.id }),
            reason,
        )?;
        self.emit(EventPayload::BalanceAdjusted(BalanceAdjustedEvent {
            account_id,
            transaction_id: tx.id,
            amount,
            new_balance: tx.balance_after,
            reference: reference.to_string(),
        }));
        info!(account_id = %account_id, amount = %amount, new_balance = %tx.balance_after, actor = %actor, "balance adjusted");
        Ok(tx)
    }

    pub fn exposure(&self, key: &ExposureKey) -> Cents {
        self.exposure.read().liability(key)
    }

    pub fn exposure_entries(&self) -> Vec<ExposureEntry> {
        self.exposure.read().entries()
    }

    pub fn exposure_for_fixture(&self, fixture_id: &FixtureId) -> Vec<ExposureEntry> {
        self.exposure.read().for_fixture(fixture_id)
    }

    pub fn max_exposure(&self) -> Option<ExposureEntry> {
        self.exposure.read().max_liability()
    }

    /// Sum over outcomes; combinations are counted once per leg.
    pub fn total_exposure(&self) -> Cents {
        self.exposure.read().total_liability()
    }

    /// Recomputes exposure from the pending bets and compares it with the running book.
    /// Only meaningful while no placement or settlement is in flight.
    pub fn verify_exposure(&self) -> Result<(), EngineError> {
        let pending = self.ledger.pending_bets()?;
        let rebuilt = ExposureBook::rebuild(&pending)?;
        let drifts = self.exposure.read().diff(&rebuilt);
        if drifts.is_empty() {
            return Ok(());
        }
        for drift in &drifts {
            warn!(%drift, "exposure drift");
        }
        Err(EngineError::ExposureDrift { drifts })
    }

    /// Replaces the running book with a rebuild. Returns how many outcomes changed.
    pub fn rebuild_exposure(&self) -> Result<usize, EngineError> {
        let pending = self.ledger.pending_bets()?;
        let rebuilt = ExposureBook::rebuild(&pending)?;
        let mut book = self.exposure.write();
        let changed = book.diff(&rebuilt).len();
        *book = rebuilt;
        if changed > 0 {
            warn!(changed, "exposure book replaced by rebuild");
        }
        Ok(changed)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().events().to_vec()
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        let events = self.events.lock();
        let all = events.events();
        let start = all.len().saturating_sub(count);
        all[start..].to_vec()
    }

    pub fn open_issues(&self) -> Vec<ReconciliationIssue> {
        self.issues.lock().open_issues()
    }

    pub fn issue(&self, issue_id: IssueId) -> Option<ReconciliationIssue> {
        self.issues.lock().get(issue_id).cloned()
    }

    pub fn all_issues(&self) -> Vec<ReconciliationIssue> {
        self.issues.lock().all()
    }

    pub fn is_halted(&self, bet_id: BetId) -> bool {
        self.halted.lock().contains_key(&bet_id)
    }

    pub fn halted_bets(&self) -> Vec<(BetId, String)> {
        let mut halted: Vec<(BetId, String)> = self
            .halted
            .lock()
            .iter()
            .map(|(id, reason)| (*id, reason.clone()))
            .collect();
        halted.sort();
        halted
    }

    // ledger call with the configured backoff on conflicts
    pub(super) fn with_retry<T, F>(&self, operation: &str, mut op: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Result<T, LedgerError>,
    {
        self.config
            .retry
            .retry(operation, LedgerError::is_transient, |_| op())
    }

    pub(super) fn emit(&self, payload: EventPayload) {
        let now = self.now();
        trace!(event = payload.name(), "event");
        self.events.lock().record(now, payload);
    }

    pub(super) fn publish_exposure(&self, keys: &[ExposureKey]) {
        let updates: Vec<ExposureUpdatedEvent> = {
            let book = self.exposure.read();
            keys.iter()
                .map(|key| {
                    let (liability, bet_count) = book
                        .entry(key)
                        .map(|e| (e.liability, e.bet_count))
                        .unwrap_or((Cents::ZERO, 0));
                    ExposureUpdatedEvent {
                        key: key.clone(),
                        liability,
                        bet_count,
                    }
                })
                .collect()
        };
        for update in updates {
            self.emit(EventPayload::ExposureUpdated(update));
        }
    }

    pub(super) fn record_audit(
        &self,
        actor: &ActorId,
        action: AuditAction,
        target_id: String,
        data_before: Value,
        data_after: Value,
        reason: &str,
    ) -> Result<(), AuditError> {
        let entry = AuditEntry {
            actor_id: actor.clone(),
            action,
            target_id,
            data_before,
            data_after,
            reason: reason.to_string(),
            recorded_at: self.now(),
        };
        self.audit.record(entry).map_err(|e| {
            error!(actor = %actor, ?action, error = %e, "audit log write failed");
            e
        })
    }
}

pub(super) fn snapshot<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
