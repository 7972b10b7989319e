//! Ledger store: the only shared mutable state in the core.
//!
//! [`LedgerStore`] is the seam between the services and persistence. Every
//! balance change goes through a logged transaction, stake reservation commits
//! bets and stake transactions together or not at all, and the settlement
//! credit for a bet (winnings or refund) exists at most once.
//!
//! Two backends ship with the crate: [`InMemoryLedger`] (per-account mutexes,
//! used by tests and the simulator) and [`SqliteLedger`] (durable, with the
//! one-credit-per-bet rule enforced by a unique index).

mod memory;
mod sqlite;

pub use memory::InMemoryLedger;
pub use sqlite::SqliteLedger;

use crate::account::{Account, Transaction, TransactionKind};
use crate::bet::{BetDraft, BetRecord, BetStatus, Selection, SelectionStatus};
use crate::types::{AccountId, BetId, Cents, FixtureId, SelectionId, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub bets: Vec<BetRecord>,
    pub transactions: Vec<Transaction>,
    pub new_balance: Cents,
}

/// Result of a pending -> terminal compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    Applied(BetRecord),
    AlreadyTerminal(BetRecord),
}

impl Finalized {
    pub fn record(&self) -> &BetRecord {
        match self {
            Finalized::Applied(r) | Finalized::AlreadyTerminal(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("bet {0} not found")]
    BetNotFound(BetId),

    #[error("selection {0} not found")]
    SelectionNotFound(SelectionId),

    #[error("insufficient funds on account {account_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        account_id: AccountId,
        requested: Cents,
        available: Cents,
    },

    /// Transient contention. Safe to retry; nothing was written.
    #[error("ledger conflict: {0}")]
    Conflict(String),

    #[error(
        "idempotency violation on bet {bet_id}: {attempted_kind} of {attempted_amount} against existing {existing}"
    )]
    IdempotencyViolation {
        bet_id: BetId,
        existing: String,
        attempted_kind: TransactionKind,
        attempted_amount: Cents,
    },

    #[error("selection {selection_id} already settled as {current}, refusing {attempted}")]
    SelectionAlreadySettled {
        selection_id: SelectionId,
        current: SelectionStatus,
        attempted: SelectionStatus,
    },

    #[error("bet {bet_id} cannot move to {to}")]
    InvalidTransition { bet_id: BetId, to: BetStatus },

    #[error("amount {0} must be positive")]
    NonPositiveAmount(Cents),

    #[error("placement carries no bets")]
    EmptyPlacement,

    #[error("balance arithmetic overflow")]
    Overflow,

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

pub trait LedgerStore: Send + Sync {
    /// Creates an account. A non-zero opening balance is logged as an adjustment.
    fn open_account(&self, opening_balance: Cents, at: Timestamp) -> Result<Account, LedgerError>;

    fn account(&self, account_id: AccountId) -> Result<Option<Account>, LedgerError>;

    fn account_ids(&self) -> Result<Vec<AccountId>, LedgerError>;

    /// Transactions for one account in creation order.
    fn transactions(&self, account_id: AccountId) -> Result<Vec<Transaction>, LedgerError>;

    /// Generic ledger entry. With `expected_balance` set this is a compare-and-swap:
    /// a stale expectation fails with `Conflict` and nothing is written.
    fn adjust_balance(
        &self,
        account_id: AccountId,
        amount: Cents,
        expected_balance: Option<Cents>,
        reference: &str,
        at: Timestamp,
    ) -> Result<Transaction, LedgerError>;

    /// Debits every draft's stake and stores the bets, all or nothing.
    fn reserve_stake_and_create_bets(
        &self,
        account_id: AccountId,
        drafts: &[BetDraft],
        placed_at: Timestamp,
    ) -> Result<Reservation, LedgerError>;

    /// Pays winnings for a bet. Repeating the call with the same amount returns
    /// the original transaction; any other second credit is an idempotency violation.
    fn credit_winnings(&self, bet_id: BetId, amount: Cents, at: Timestamp) -> Result<Transaction, LedgerError>;

    /// Returns the original stake. Idempotent in the same way as `credit_winnings`.
    fn refund_stake(&self, bet_id: BetId, at: Timestamp) -> Result<Transaction, LedgerError>;

    /// Moves a pending bet to a terminal status. Already terminal bets come back untouched.
    fn finalize_bet(
        &self,
        bet_id: BetId,
        status: BetStatus,
        actual_winnings: Cents,
        settled_at: Timestamp,
    ) -> Result<Finalized, LedgerError>;

    /// Records a leg result. Re-applying the same status is a no-op.
    fn set_selection_status(
        &self,
        selection_id: SelectionId,
        status: SelectionStatus,
    ) -> Result<Selection, LedgerError>;

    fn bet(&self, bet_id: BetId) -> Result<Option<BetRecord>, LedgerError>;

    fn pending_bets(&self) -> Result<Vec<BetRecord>, LedgerError>;

    fn pending_bets_for_fixture(&self, fixture_id: &FixtureId) -> Result<Vec<BetRecord>, LedgerError>;

    /// Every bet with a leg on the fixture, settled or not, in id order.
    fn bets_for_fixture(&self, fixture_id: &FixtureId) -> Result<Vec<BetRecord>, LedgerError>;

    /// Fixtures referenced by at least one pending bet.
    fn pending_fixtures(&self) -> Result<Vec<FixtureId>, LedgerError>;

    /// The winnings or refund transaction for a bet, if one exists.
    fn settlement_credit(&self, bet_id: BetId) -> Result<Option<Transaction>, LedgerError>;
}

// shared by both backends: what a second settlement credit for a bet means.
pub(crate) fn check_existing_credit(
    bet_id: BetId,
    existing: &Transaction,
    kind: TransactionKind,
    amount: Cents,
) -> Result<(), LedgerError> {
    if existing.kind == kind && existing.amount == amount {
        return Ok(());
    }
    Err(LedgerError::IdempotencyViolation {
        bet_id,
        existing: format!("{} of {}", existing.kind, existing.amount),
        attempted_kind: kind,
        attempted_amount: amount,
    })
}

pub(crate) fn check_finalize_target(bet_id: BetId, status: BetStatus) -> Result<(), LedgerError> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(LedgerError::InvalidTransition { bet_id, to: status })
    }
}
