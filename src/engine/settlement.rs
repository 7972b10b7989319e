//! Settlement: automatic from fixture results, manual override, cashout.
//!
//! Every path credits first and finalizes second. The credit is idempotent per
//! bet, so a retry after a failure between the two writes replays the credit
//! as a no-op and then finishes the status change. A credit that disagrees with
//! the one on record halts the bet until an operator releases it.

use super::core::{snapshot, Engine};
use super::results::{SettleReport, SettlementError, SettlementSummary};
use crate::account::{Transaction, TransactionKind};
use crate::audit::AuditAction;
use crate::bet::{BetRecord, BetStatus};
use crate::events::{
    BetSettledEvent, CashedOutEvent, CreditEvent, EventPayload, ForcedSettlementEvent, SelectionSettledEvent,
    SettlementHaltedEvent,
};
use crate::feed::{FixtureResult, OutcomeFingerprint};
use crate::payout::{resolve, Resolution};
use crate::store::{Finalized, LedgerError};
use crate::types::{ActorId, BetId, Cents};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

/// Outcome an operator imposes on a pending bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ForcedOutcome {
    /// Pays `winnings`, or the bet's potential winnings when absent.
    Won { winnings: Option<Cents> },
    Lost,
    Void,
    Cancelled,
}

impl ForcedOutcome {
    fn status(&self) -> BetStatus {
        match self {
            ForcedOutcome::Won { .. } => BetStatus::Won,
            ForcedOutcome::Lost => BetStatus::Lost,
            ForcedOutcome::Void => BetStatus::Void,
            ForcedOutcome::Cancelled => BetStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreditPlan {
    Nothing,
    Winnings(Cents),
    Refund,
}

// removes the bet from the in-flight set when dropped
struct SettlementGuard<'a> {
    in_flight: &'a Mutex<HashSet<BetId>>,
    bet_id: BetId,
}

impl Drop for SettlementGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.bet_id);
    }
}

impl Engine {
    /// Settles a bet from its selection statuses. Safe to call any number of times.
    pub fn settle_bet(&self, bet_id: BetId) -> Result<SettleReport, SettlementError> {
        let _guard = self.begin_settlement(bet_id)?;
        let record = self.load_bet(bet_id)?;
        if !record.is_pending() {
            debug!(bet_id = %bet_id, status = %record.bet.status, "bet already terminal");
            return Ok(SettleReport::Unchanged {
                bet_id,
                status: record.bet.status,
            });
        }

        let resolution = resolve(
            record.bet.bet_type,
            record.bet.stake,
            &record.legs(),
            self.config.settlement.void_leg_policy,
        )?;
        let (status, plan) = match resolution {
            Resolution::Pending => return Ok(SettleReport::StillPending { bet_id }),
            Resolution::Won(amount) => (BetStatus::Won, CreditPlan::Winnings(amount)),
            Resolution::Lost => (BetStatus::Lost, CreditPlan::Nothing),
            Resolution::Void => (BetStatus::Void, CreditPlan::Refund),
        };
        self.finish(&record, status, plan)
    }

    /// Applies a final fixture result: records every leg it decides, then settles
    /// each pending bet on the fixture. Provisional results are ignored and outcomes
    /// the result lists with conflicting statuses are left pending.
    pub fn apply_fixture_result(&self, result: &FixtureResult) -> Result<SettlementSummary, SettlementError> {
        let mut summary = SettlementSummary::default();
        if !result.is_final() {
            debug!(fixture_id = %result.fixture_id, "provisional result ignored");
            return Ok(summary);
        }

        let fixture_id = &result.fixture_id;
        summary.conflicting_outcomes = result.conflicts().len();
        let decided: OutcomeFingerprint = result
            .fingerprint()
            .into_iter()
            .filter(|(_, status)| status.is_terminal())
            .collect();

        let pending = self.ledger.pending_bets_for_fixture(fixture_id)?;
        for record in &pending {
            let open_legs = record
                .selections
                .iter()
                .filter(|s| &s.fixture_id == fixture_id && !s.status.is_terminal());
            for selection in open_legs {
                let key = (selection.market_key.clone(), selection.outcome_key.clone());
                let Some(&status) = decided.get(&key) else {
                    continue;
                };
                match self.with_retry("set_selection_status", || {
                    self.ledger.set_selection_status(selection.id, status)
                }) {
                    Ok(_) => {
                        summary.selections_updated += 1;
                        self.emit(EventPayload::SelectionSettled(SelectionSettledEvent {
                            selection_id: selection.id,
                            bet_id: record.id(),
                            fixture_id: fixture_id.clone(),
                            status,
                        }));
                    }
                    Err(e @ LedgerError::SelectionAlreadySettled { .. }) => {
                        warn!(selection_id = %selection.id, bet_id = %record.id(), error = %e, "selection keeps its first result");
                    }
                    Err(e) => summary.failures.push((record.id(), e.to_string())),
                }
            }
        }

        for record in &pending {
            let bet_id = record.id();
            match self.settle_bet(bet_id) {
                Ok(SettleReport::StillPending { .. }) => summary.still_pending.push(bet_id),
                Ok(report) => summary.settled.push(report),
                Err(e) => {
                    warn!(bet_id = %bet_id, fixture_id = %fixture_id, error = %e, "bet not settled");
                    summary.failures.push((bet_id, e.to_string()));
                }
            }
        }

        self.tracker.lock().record_applied(fixture_id, &decided, self.now());
        info!(
            fixture_id = %fixture_id,
            selections = summary.selections_updated,
            settled = summary.settled_count(),
            still_pending = summary.still_pending.len(),
            failures = summary.failures.len(),
            "fixture result applied"
        );
        Ok(summary)
    }

    /// Operator override. Skips leg derivation but pays through the same idempotent credit path.
    pub fn force_settle(
        &self,
        bet_id: BetId,
        outcome: ForcedOutcome,
        reason: &str,
        actor: &ActorId,
    ) -> Result<SettleReport, SettlementError> {
        if reason.trim().is_empty() {
            return Err(SettlementError::MissingReason);
        }
        let _guard = self.begin_settlement(bet_id)?;
        let record = self.load_bet(bet_id)?;
        if !record.is_pending() {
            debug!(bet_id = %bet_id, status = %record.bet.status, "force settle on terminal bet ignored");
            return Ok(SettleReport::Unchanged {
                bet_id,
                status: record.bet.status,
            });
        }

        let plan = match outcome {
            ForcedOutcome::Won { winnings } => {
                let max = record.bet.potential_winnings;
                let amount = winnings.unwrap_or(max);
                if !amount.is_positive() || amount > max {
                    return Err(SettlementError::InvalidAmount { bet_id, amount, max });
                }
                CreditPlan::Winnings(amount)
            }
            ForcedOutcome::Lost => CreditPlan::Nothing,
            ForcedOutcome::Void | ForcedOutcome::Cancelled => CreditPlan::Refund,
        };
        let status = outcome.status();
        let report = self.finish(&record, status, plan)?;

        if report.is_settled() {
            let after = self.ledger.bet(bet_id)?;
            self.record_audit(
                actor,
                AuditAction::ForceSettle,
                bet_id.to_string(),
                snapshot(&record),
                snapshot(&after),
                reason,
            )?;
            self.emit(EventPayload::ForcedSettlement(ForcedSettlementEvent {
                bet_id,
                actor_id: actor.clone(),
                status,
                reason: reason.to_string(),
            }));
            warn!(bet_id = %bet_id, actor = %actor, status = %status, reason, "bet force settled");
        }
        Ok(report)
    }

    /// Early payout of `amount` on a pending bet. The bet ends in `cashout`.
    pub fn cash_out(&self, bet_id: BetId, amount: Cents, actor: &ActorId) -> Result<SettleReport, SettlementError> {
        let _guard = self.begin_settlement(bet_id)?;
        let record = self.load_bet(bet_id)?;
        if !record.is_pending() {
            return Ok(SettleReport::Unchanged {
                bet_id,
                status: record.bet.status,
            });
        }
        let max = record.bet.potential_winnings;
        if !amount.is_positive() || amount > max {
            return Err(SettlementError::InvalidAmount { bet_id, amount, max });
        }

        let report = self.finish(&record, BetStatus::Cashout, CreditPlan::Winnings(amount))?;
        if report.is_settled() {
            let after = self.ledger.bet(bet_id)?;
            self.record_audit(
                actor,
                AuditAction::CashOut,
                bet_id.to_string(),
                snapshot(&record),
                snapshot(&after),
                &format!("cashout of {}", amount),
            )?;
            self.emit(EventPayload::CashedOut(CashedOutEvent {
                bet_id,
                account_id: record.bet.account_id,
                actor_id: actor.clone(),
                amount,
            }));
            info!(bet_id = %bet_id, amount = %amount, actor = %actor, "bet cashed out");
        }
        Ok(report)
    }

    /// Lifts the quarantine placed on a bet after an idempotency violation.
    pub fn release_halt(&self, bet_id: BetId, actor: &ActorId, reason: &str) -> Result<(), SettlementError> {
        if reason.trim().is_empty() {
            return Err(SettlementError::MissingReason);
        }
        let previous = self
            .halted
            .lock()
            .remove(&bet_id)
            .ok_or(SettlementError::NotHalted(bet_id))?;
        self.record_audit(
            actor,
            AuditAction::ReleaseHalt,
            bet_id.to_string(),
            json!({ "halted": previous }),
            json!({ "halted": null }),
            reason,
        )?;
        info!(bet_id = %bet_id, actor = %actor, "settlement halt released");
        Ok(())
    }

    fn begin_settlement(&self, bet_id: BetId) -> Result<SettlementGuard<'_>, SettlementError> {
        if let Some(reason) = self.halted.lock().get(&bet_id).cloned() {
            return Err(SettlementError::Halted { bet_id, reason });
        }
        if !self.in_flight.lock().insert(bet_id) {
            debug!(bet_id = %bet_id, "settlement already in flight");
            return Err(SettlementError::InFlight(bet_id));
        }
        Ok(SettlementGuard {
            in_flight: &self.in_flight,
            bet_id,
        })
    }

    fn load_bet(&self, bet_id: BetId) -> Result<BetRecord, SettlementError> {
        self.ledger.bet(bet_id)?.ok_or(SettlementError::BetNotFound(bet_id))
    }

    // 8.3: credit or refund, then the pending -> terminal swap, then exposure and events
    fn finish(&self, record: &BetRecord, status: BetStatus, plan: CreditPlan) -> Result<SettleReport, SettlementError> {
        let bet_id = record.id();
        let at = self.now();

        let credit = match plan {
            CreditPlan::Winnings(amount) if amount.is_positive() => Some(
                self.with_retry("credit_winnings", || self.ledger.credit_winnings(bet_id, amount, at))
                    .map_err(|e| self.credit_failed(bet_id, e))?,
            ),
            CreditPlan::Refund => Some(
                self.with_retry("refund_stake", || self.ledger.refund_stake(bet_id, at))
                    .map_err(|e| self.credit_failed(bet_id, e))?,
            ),
            _ => None,
        };
        let actual_winnings = match plan {
            CreditPlan::Winnings(amount) => amount,
            _ => Cents::ZERO,
        };

        let finalized = self.with_retry("finalize_bet", || {
            self.ledger.finalize_bet(bet_id, status, actual_winnings, at)
        })?;
        let settled = match finalized {
            Finalized::AlreadyTerminal(current) => {
                debug!(bet_id = %bet_id, status = %current.bet.status, "bet finalized elsewhere");
                return Ok(SettleReport::Unchanged {
                    bet_id,
                    status: current.bet.status,
                });
            }
            Finalized::Applied(settled) => settled,
        };

        let keys = self.exposure.write().remove_bet(bet_id);
        if let Some(tx) = &credit {
            self.emit_credit(tx);
        }
        self.emit(EventPayload::BetSettled(BetSettledEvent {
            bet_id,
            account_id: settled.bet.account_id,
            status,
            actual_winnings,
        }));
        self.publish_exposure(&keys);

        info!(
            bet_id = %bet_id,
            account_id = %settled.bet.account_id,
            status = %status,
            actual_winnings = %actual_winnings,
            "bet settled"
        );
        Ok(SettleReport::Settled {
            bet_id,
            status,
            actual_winnings,
            credit,
        })
    }

    fn emit_credit(&self, tx: &Transaction) {
        let Some(bet_id) = tx.bet_id() else {
            return;
        };
        let event = CreditEvent {
            bet_id,
            account_id: tx.account_id,
            transaction_id: tx.id,
            kind: tx.kind,
            amount: tx.amount,
            new_balance: tx.balance_after,
        };
        match tx.kind {
            TransactionKind::Refund => self.emit(EventPayload::StakeRefunded(event)),
            _ => self.emit(EventPayload::WinningsCredited(event)),
        }
    }

    fn credit_failed(&self, bet_id: BetId, err: LedgerError) -> SettlementError {
        if !matches!(err, LedgerError::IdempotencyViolation { .. }) {
            return err.into();
        }
        let detail = err.to_string();
        self.halted.lock().insert(bet_id, detail.clone());
        error!(bet_id = %bet_id, error = %detail, "second settlement credit refused, bet halted");
        self.emit(EventPayload::SettlementHalted(SettlementHaltedEvent {
            bet_id,
            reason: detail.clone(),
        }));
        SettlementError::IdempotencyViolation { bet_id, detail }
    }
}
