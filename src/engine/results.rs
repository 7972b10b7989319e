// 8.0.2: result types and errors for engine operations.

use crate::account::Transaction;
use crate::audit::AuditError;
use crate::bet::{BetRecord, BetStatus};
use crate::config::ConfigError;
use crate::exposure::ExposureDrift;
use crate::payout::{PayoutError, PayoutQuote};
use crate::reconciliation::{IssueError, ReconciliationIssue};
use crate::store::LedgerError;
use crate::types::{AccountId, BetId, Cents, FixtureId, MarketKey, Odds, OutcomeKey};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct PlacementResult {
    pub bets: Vec<BetRecord>,
    pub transactions: Vec<Transaction>,
    pub new_balance: Cents,
    pub quotes: Vec<PayoutQuote>,
}

impl PlacementResult {
    pub fn total_stake(&self) -> Cents {
        self.bets.iter().map(|b| b.bet.stake).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleReport {
    Settled {
        bet_id: BetId,
        status: BetStatus,
        actual_winnings: Cents,
        credit: Option<Transaction>,
    },
    /// At least one leg has no result yet.
    StillPending { bet_id: BetId },
    /// The bet was already terminal; nothing was written.
    Unchanged { bet_id: BetId, status: BetStatus },
}

impl SettleReport {
    pub fn bet_id(&self) -> BetId {
        match self {
            SettleReport::Settled { bet_id, .. }
            | SettleReport::StillPending { bet_id }
            | SettleReport::Unchanged { bet_id, .. } => *bet_id,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, SettleReport::Settled { .. })
    }
}

/// What applying one fixture result did.
#[derive(Debug, Clone, Default)]
pub struct SettlementSummary {
    pub selections_updated: usize,
    /// Outcomes left alone because the result listed them with conflicting statuses.
    pub conflicting_outcomes: usize,
    pub settled: Vec<SettleReport>,
    pub still_pending: Vec<BetId>,
    pub failures: Vec<(BetId, String)>,
}

impl SettlementSummary {
    pub fn settled_count(&self) -> usize {
        self.settled.iter().filter(|r| r.is_settled()).count()
    }
}

/// How the result feed looked for a fixture during a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultState {
    Final,
    Provisional,
    Absent,
    FeedError(String),
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub fixture_id: FixtureId,
    pub result: ResultState,
    pub pending_before: usize,
    pub settlement: Option<SettlementSummary>,
    pub raised: Vec<ReconciliationIssue>,
    pub escalated: Vec<ReconciliationIssue>,
    pub resolved: Vec<ReconciliationIssue>,
}

impl ReconcileReport {
    pub(super) fn new(fixture_id: FixtureId, pending_before: usize) -> Self {
        Self {
            fixture_id,
            result: ResultState::Absent,
            pending_before,
            settlement: None,
            raised: Vec::new(),
            escalated: Vec::new(),
            resolved: Vec::new(),
        }
    }
}

/// One pass of the reconciliation worker over every fixture that needs attention.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub reports: Vec<ReconcileReport>,
    pub failures: Vec<(FixtureId, String)>,
}

impl SweepReport {
    pub fn feed_errors(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.result, ResultState::FeedError(_)))
            .count()
    }

    pub fn issues_raised(&self) -> usize {
        self.reports.iter().map(|r| r.raised.len()).sum()
    }
}

/// Client-correctable request problems. Nothing is written when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("stake {stake} outside [{min}, {max}]")]
    StakeOutOfRange { stake: Cents, min: Cents, max: Cents },

    #[error("{bet_type} bet needs {min} to {max} selections, got {actual}")]
    SelectionCount {
        bet_type: &'static str,
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("system fold {fold} is invalid for {selections} selections")]
    InvalidFold { fold: u8, selections: usize },

    #[error("odds {odds} outside [{min}, {max}]")]
    OddsOutOfRange { odds: Odds, min: Decimal, max: Decimal },

    #[error("selection {fixture_id}/{market_key}/{outcome_key} appears more than once")]
    DuplicateSelection {
        fixture_id: FixtureId,
        market_key: MarketKey,
        outcome_key: OutcomeKey,
    },

    #[error("legs on the same market {fixture_id}/{market_key} cannot share a bet")]
    CorrelatedLegs { fixture_id: FixtureId, market_key: MarketKey },

    #[error("payout error: {0}")]
    Payout(#[from] PayoutError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("insufficient funds on account {account_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        account_id: AccountId,
        requested: Cents,
        available: Cents,
    },

    #[error("market {fixture_id}/{market_key} is closed")]
    MarketClosed { fixture_id: FixtureId, market_key: MarketKey },

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("ledger error: {0}")]
    Ledger(LedgerError),
}

impl From<LedgerError> for PlacementError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                account_id,
                requested,
                available,
            } => PlacementError::InsufficientFunds {
                account_id,
                requested,
                available,
            },
            LedgerError::AccountNotFound(id) => PlacementError::AccountNotFound(id),
            other => PlacementError::Ledger(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementError {
    #[error("bet {0} not found")]
    BetNotFound(BetId),

    #[error("bet {0} is being settled by another caller")]
    InFlight(BetId),

    #[error("settlement of bet {bet_id} is halted: {reason}")]
    Halted { bet_id: BetId, reason: String },

    #[error("idempotency violation on bet {bet_id}: {detail}")]
    IdempotencyViolation { bet_id: BetId, detail: String },

    #[error("a manual action needs a non-empty reason")]
    MissingReason,

    #[error("amount {amount} for bet {bet_id} must be in (0, {max}]")]
    InvalidAmount { bet_id: BetId, amount: Cents, max: Cents },

    #[error("bet {0} is not halted")]
    NotHalted(BetId),

    #[error("payout error: {0}")]
    Payout(#[from] PayoutError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("issue error: {0}")]
    Issue(#[from] IssueError),

    #[error("a manual resolution needs a non-empty note")]
    MissingReason,

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("settlement error: {0}")]
    Settlement(#[from] SettlementError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Payout error: {0}")]
    Payout(#[from] PayoutError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("A manual adjustment needs a non-empty reason")]
    MissingReason,

    #[error("Exposure drifted from the pending bet set on {} outcomes", .drifts.len())]
    ExposureDrift { drifts: Vec<ExposureDrift> },
}
