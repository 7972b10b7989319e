//! Accounts and the append-only transaction log.
//!
//! An account's balance only ever moves through a [`Transaction`]. Replaying an
//! account's transactions in creation order must land on the stored balance
//! exactly; [`verify_replay`] is that check.

use crate::types::{AccountId, BetId, Cents, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Cents,
    pub created_at: Timestamp,
}

impl Account {
    pub fn new(id: AccountId, created_at: Timestamp) -> Self {
        Self {
            id,
            balance: Cents::zero(),
            created_at,
        }
    }

    /// Computes the balance after applying `amount` without mutating anything.
    /// Debits that would take the balance below zero are refused.
    pub fn preview(&self, amount: Cents) -> Result<Cents, AccountError> {
        let after = self
            .balance
            .checked_add(amount)
            .ok_or(AccountError::Overflow)?;
        if after.is_negative() {
            return Err(AccountError::InsufficientFunds {
                requested: amount.negate(),
                available: self.balance,
            });
        }
        Ok(after)
    }

    /// Applies `amount` and returns `(before, after)`.
    pub fn apply(&mut self, amount: Cents) -> Result<(Cents, Cents), AccountError> {
        let before = self.balance;
        let after = self.preview(amount)?;
        self.balance = after;
        Ok((before, after))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Stake,
    Winnings,
    Refund,
    Adjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Stake => "stake",
            TransactionKind::Winnings => "winnings",
            TransactionKind::Refund => "refund",
            TransactionKind::Adjustment => "adjustment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stake" => Some(TransactionKind::Stake),
            "winnings" => Some(TransactionKind::Winnings),
            "refund" => Some(TransactionKind::Refund),
            "adjustment" => Some(TransactionKind::Adjustment),
            _ => None,
        }
    }

    /// Credits that close out a bet. At most one of these may exist per bet.
    pub fn is_settlement_credit(&self) -> bool {
        matches!(self, TransactionKind::Winnings | TransactionKind::Refund)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transaction points at: one of our bets, or something outside the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum TransactionRef {
    Bet(BetId),
    External(String),
}

impl TransactionRef {
    pub fn bet_id(&self) -> Option<BetId> {
        match self {
            TransactionRef::Bet(id) => Some(*id),
            TransactionRef::External(_) => None,
        }
    }
}

impl fmt::Display for TransactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionRef::Bet(id) => write!(f, "bet:{}", id),
            TransactionRef::External(reference) => write!(f, "ext:{}", reference),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub kind: TransactionKind,
    pub amount: Cents,
    pub balance_before: Cents,
    pub balance_after: Cents,
    pub reference: TransactionRef,
    pub created_at: Timestamp,
}

impl Transaction {
    pub fn bet_id(&self) -> Option<BetId> {
        self.reference.bet_id()
    }

    /// A record is internally consistent when before + amount = after.
    pub fn is_consistent(&self) -> bool {
        self.balance_before.checked_add(self.amount) == Some(self.balance_after)
    }
}

/// Sums transaction amounts in order.
pub fn replay_balance<'a, I>(transactions: I) -> Cents
where
    I: IntoIterator<Item = &'a Transaction>,
{
    transactions.into_iter().map(|t| t.amount).sum()
}

/// Checks the log against the stored balance. Each record's before/after must
/// chain onto the previous one and the final sum must equal `account.balance`.
pub fn verify_replay(account: &Account, transactions: &[Transaction]) -> Result<(), ReplayMismatch> {
    let mut running = Cents::zero();
    for tx in transactions {
        if tx.account_id != account.id {
            return Err(ReplayMismatch::ForeignTransaction {
                account_id: account.id,
                transaction_id: tx.id,
            });
        }
        if tx.balance_before != running || !tx.is_consistent() {
            return Err(ReplayMismatch::BrokenChain {
                transaction_id: tx.id,
                expected_before: running,
                recorded_before: tx.balance_before,
            });
        }
        running = tx.balance_after;
    }
    if running != account.balance {
        return Err(ReplayMismatch::BalanceDiffers {
            account_id: account.id,
            replayed: running,
            stored: account.balance,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayMismatch {
    #[error("transaction {transaction_id} does not belong to account {account_id}")]
    ForeignTransaction {
        account_id: AccountId,
        transaction_id: TransactionId,
    },

    #[error("transaction {transaction_id} starts at {recorded_before}, expected {expected_before}")]
    BrokenChain {
        transaction_id: TransactionId,
        expected_before: Cents,
        recorded_before: Cents,
    },

    #[error("account {account_id} replays to {replayed} but stores {stored}")]
    BalanceDiffers {
        account_id: AccountId,
        replayed: Cents,
        stored: Cents,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Cents, available: Cents },

    #[error("Balance arithmetic overflow")]
    Overflow,
}
