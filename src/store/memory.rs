// 10.3 memory.rs: in-process ledger.
// one mutex per account serializes balance changes; the bet table sits behind a single rwlock.
// lock order is always account -> bet table, never the reverse.

use super::{check_existing_credit, check_finalize_target, Finalized, LedgerError, LedgerStore, Reservation};
use crate::account::{Account, AccountError, Transaction, TransactionKind, TransactionRef};
use crate::bet::{Bet, BetDraft, BetRecord, BetStatus, Selection, SelectionStatus};
use crate::types::{AccountId, BetId, Cents, FixtureId, SelectionId, Timestamp, TransactionId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct AccountBook {
    account: Account,
    log: Vec<Transaction>,
}

#[derive(Debug, Default)]
struct BetTable {
    bets: HashMap<BetId, BetRecord>,
    selection_owner: HashMap<SelectionId, BetId>,
    credits: HashMap<BetId, Transaction>,
    pending_by_fixture: BTreeMap<FixtureId, BTreeSet<BetId>>,
}

impl BetTable {
    fn unindex_pending(&mut self, record: &BetRecord) {
        for selection in &record.selections {
            if let Some(set) = self.pending_by_fixture.get_mut(&selection.fixture_id) {
                set.remove(&record.bet.id);
                if set.is_empty() {
                    self.pending_by_fixture.remove(&selection.fixture_id);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct InMemoryLedger {
    accounts: RwLock<HashMap<AccountId, Arc<Mutex<AccountBook>>>>,
    bets: RwLock<BetTable>,
    next_account: AtomicU64,
    next_bet: AtomicU64,
    next_selection: AtomicU64,
    next_transaction: AtomicU64,
    lock_timeout: Duration,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a writer waits for an account before giving up with `Conflict`.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            bets: RwLock::new(BetTable::default()),
            next_account: AtomicU64::new(1),
            next_bet: AtomicU64::new(1),
            next_selection: AtomicU64::new(1),
            next_transaction: AtomicU64::new(1),
            lock_timeout,
        }
    }

    fn handle(&self, account_id: AccountId) -> Result<Arc<Mutex<AccountBook>>, LedgerError> {
        self.accounts
            .read()
            .get(&account_id)
            .cloned()
            .ok_or(LedgerError::AccountNotFound(account_id))
    }

    fn lock<'a>(
        &self,
        handle: &'a Mutex<AccountBook>,
        account_id: AccountId,
    ) -> Result<MutexGuard<'a, AccountBook>, LedgerError> {
        handle.try_lock_for(self.lock_timeout).ok_or_else(|| {
            debug!(account_id = %account_id, timeout_ms = self.lock_timeout.as_millis() as u64, "account lock timed out");
            LedgerError::Conflict(format!("account {} is busy", account_id))
        })
    }

    fn transaction_id(&self) -> TransactionId {
        TransactionId(self.next_transaction.fetch_add(1, Ordering::Relaxed))
    }

    fn materialize(&self, account_id: AccountId, draft: &BetDraft, placed_at: Timestamp) -> BetRecord {
        let bet_id = BetId(self.next_bet.fetch_add(1, Ordering::Relaxed));
        let selections = draft
            .selections
            .iter()
            .map(|spec| Selection {
                id: SelectionId(self.next_selection.fetch_add(1, Ordering::Relaxed)),
                bet_id,
                fixture_id: spec.fixture_id.clone(),
                market_key: spec.market_key.clone(),
                outcome_key: spec.outcome_key.clone(),
                odds: spec.odds,
                status: SelectionStatus::Pending,
            })
            .collect();
        BetRecord {
            bet: Bet {
                id: bet_id,
                account_id,
                bet_type: draft.bet_type,
                stake: draft.stake,
                total_odds: draft.total_odds,
                potential_winnings: draft.potential_winnings,
                actual_winnings: Cents::zero(),
                status: BetStatus::Pending,
                placed_at,
                settled_at: None,
            },
            selections,
        }
    }

    // winnings and refunds share everything except the amount.
    fn settlement_credit_tx(
        &self,
        bet_id: BetId,
        kind: TransactionKind,
        amount: Option<Cents>,
        at: Timestamp,
    ) -> Result<Transaction, LedgerError> {
        let account_id = self
            .bets
            .read()
            .bets
            .get(&bet_id)
            .map(|r| r.bet.account_id)
            .ok_or(LedgerError::BetNotFound(bet_id))?;

        let handle = self.handle(account_id)?;
        let mut book = self.lock(&handle, account_id)?;
        let mut table = self.bets.write();

        let record = table.bets.get(&bet_id).ok_or(LedgerError::BetNotFound(bet_id))?;
        let amount = amount.unwrap_or(record.bet.stake);
        if !amount.is_positive() {
            return Err(LedgerError::NonPositiveAmount(amount));
        }
        if let Some(existing) = table.credits.get(&bet_id) {
            check_existing_credit(bet_id, existing, kind, amount)?;
            debug!(bet_id = %bet_id, kind = %kind, "settlement credit already applied");
            return Ok(existing.clone());
        }
        if record.bet.status.is_terminal() {
            return Err(LedgerError::IdempotencyViolation {
                bet_id,
                existing: format!("bet already {}", record.bet.status),
                attempted_kind: kind,
                attempted_amount: amount,
            });
        }

        let (before, after) = book.account.apply(amount).map_err(|e| account_error(account_id, e))?;
        let tx = Transaction {
            id: self.transaction_id(),
            account_id,
            kind,
            amount,
            balance_before: before,
            balance_after: after,
            reference: TransactionRef::Bet(bet_id),
            created_at: at,
        };
        book.log.push(tx.clone());
        table.credits.insert(bet_id, tx.clone());
        Ok(tx)
    }
}

fn account_error(account_id: AccountId, err: AccountError) -> LedgerError {
    match err {
        AccountError::InsufficientFunds { requested, available } => LedgerError::InsufficientFunds {
            account_id,
            requested,
            available,
        },
        AccountError::Overflow => LedgerError::Overflow,
    }
}

impl LedgerStore for InMemoryLedger {
    fn open_account(&self, opening_balance: Cents, at: Timestamp) -> Result<Account, LedgerError> {
        if opening_balance.is_negative() {
            return Err(LedgerError::NonPositiveAmount(opening_balance));
        }
        let account_id = AccountId(self.next_account.fetch_add(1, Ordering::Relaxed));
        let mut book = AccountBook {
            account: Account::new(account_id, at),
            log: Vec::new(),
        };
        if opening_balance.is_positive() {
            let (before, after) = book
                .account
                .apply(opening_balance)
                .map_err(|e| account_error(account_id, e))?;
            book.log.push(Transaction {
                id: self.transaction_id(),
                account_id,
                kind: TransactionKind::Adjustment,
                amount: opening_balance,
                balance_before: before,
                balance_after: after,
                reference: TransactionRef::External("opening-balance".to_string()),
                created_at: at,
            });
        }
        let account = book.account.clone();
        self.accounts.write().insert(account_id, Arc::new(Mutex::new(book)));
        Ok(account)
    }

    fn account(&self, account_id: AccountId) -> Result<Option<Account>, LedgerError> {
        let handle = match self.handle(account_id) {
            Ok(handle) => handle,
            Err(LedgerError::AccountNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let account = handle.lock().account.clone();
        Ok(Some(account))
    }

    fn account_ids(&self) -> Result<Vec<AccountId>, LedgerError> {
        let mut ids: Vec<AccountId> = self.accounts.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn transactions(&self, account_id: AccountId) -> Result<Vec<Transaction>, LedgerError> {
        let handle = self.handle(account_id)?;
        let log = handle.lock().log.clone();
        Ok(log)
    }

    fn adjust_balance(
        &self,
        account_id: AccountId,
        amount: Cents,
        expected_balance: Option<Cents>,
        reference: &str,
        at: Timestamp,
    ) -> Result<Transaction, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::NonPositiveAmount(amount));
        }
        let handle = self.handle(account_id)?;
        let mut book = self.lock(&handle, account_id)?;
        if let Some(expected) = expected_balance {
            if book.account.balance != expected {
                return Err(LedgerError::Conflict(format!(
                    "account {} balance is {}, expected {}",
                    account_id, book.account.balance, expected
                )));
            }
        }
        let (before, after) = book.account.apply(amount).map_err(|e| account_error(account_id, e))?;
        let tx = Transaction {
            id: self.transaction_id(),
            account_id,
            kind: TransactionKind::Adjustment,
            amount,
            balance_before: before,
            balance_after: after,
            reference: TransactionRef::External(reference.to_string()),
            created_at: at,
        };
        book.log.push(tx.clone());
        Ok(tx)
    }

    fn reserve_stake_and_create_bets(
        &self,
        account_id: AccountId,
        drafts: &[BetDraft],
        placed_at: Timestamp,
    ) -> Result<Reservation, LedgerError> {
        if drafts.is_empty() {
            return Err(LedgerError::EmptyPlacement);
        }
        let mut total = Cents::zero();
        for draft in drafts {
            if !draft.stake.is_positive() {
                return Err(LedgerError::NonPositiveAmount(draft.stake));
            }
            total = total.checked_add(draft.stake).ok_or(LedgerError::Overflow)?;
        }

        let handle = self.handle(account_id)?;
        let mut book = self.lock(&handle, account_id)?;
        book.account
            .preview(total.negate())
            .map_err(|e| account_error(account_id, e))?;

        // everything fallible happens before the first write
        let records: Vec<BetRecord> = drafts
            .iter()
            .map(|d| self.materialize(account_id, d, placed_at))
            .collect();
        let mut running = book.account.balance;
        let mut transactions = Vec::with_capacity(records.len());
        for record in &records {
            let after = running
                .checked_sub(record.bet.stake)
                .ok_or(LedgerError::Overflow)?;
            transactions.push(Transaction {
                id: self.transaction_id(),
                account_id,
                kind: TransactionKind::Stake,
                amount: record.bet.stake.negate(),
                balance_before: running,
                balance_after: after,
                reference: TransactionRef::Bet(record.bet.id),
                created_at: placed_at,
            });
            running = after;
        }

        let mut table = self.bets.write();
        for record in &records {
            for selection in &record.selections {
                table.selection_owner.insert(selection.id, record.bet.id);
                table
                    .pending_by_fixture
                    .entry(selection.fixture_id.clone())
                    .or_default()
                    .insert(record.bet.id);
            }
            table.bets.insert(record.bet.id, record.clone());
        }
        book.account.balance = running;
        book.log.extend(transactions.iter().cloned());

        Ok(Reservation {
            bets: records,
            transactions,
            new_balance: running,
        })
    }

    fn credit_winnings(&self, bet_id: BetId, amount: Cents, at: Timestamp) -> Result<Transaction, LedgerError> {
        self.settlement_credit_tx(bet_id, TransactionKind::Winnings, Some(amount), at)
    }

    fn refund_stake(&self, bet_id: BetId, at: Timestamp) -> Result<Transaction, LedgerError> {
        self.settlement_credit_tx(bet_id, TransactionKind::Refund, None, at)
    }

    fn finalize_bet(
        &self,
        bet_id: BetId,
        status: BetStatus,
        actual_winnings: Cents,
        settled_at: Timestamp,
    ) -> Result<Finalized, LedgerError> {
        check_finalize_target(bet_id, status)?;
        let mut table = self.bets.write();
        let record = table.bets.get_mut(&bet_id).ok_or(LedgerError::BetNotFound(bet_id))?;
        if record.bet.status.is_terminal() {
            return Ok(Finalized::AlreadyTerminal(record.clone()));
        }
        record.bet.status = status;
        record.bet.actual_winnings = actual_winnings;
        record.bet.settled_at = Some(settled_at);
        let snapshot = record.clone();
        table.unindex_pending(&snapshot);
        Ok(Finalized::Applied(snapshot))
    }

    fn set_selection_status(
        &self,
        selection_id: SelectionId,
        status: SelectionStatus,
    ) -> Result<Selection, LedgerError> {
        let mut table = self.bets.write();
        let bet_id = *table
            .selection_owner
            .get(&selection_id)
            .ok_or(LedgerError::SelectionNotFound(selection_id))?;
        let selection = table
            .bets
            .get_mut(&bet_id)
            .and_then(|r| r.selections.iter_mut().find(|s| s.id == selection_id))
            .ok_or(LedgerError::SelectionNotFound(selection_id))?;
        if selection.status == status {
            return Ok(selection.clone());
        }
        if selection.status.is_terminal() {
            return Err(LedgerError::SelectionAlreadySettled {
                selection_id,
                current: selection.status,
                attempted: status,
            });
        }
        selection.status = status;
        Ok(selection.clone())
    }

    fn bet(&self, bet_id: BetId) -> Result<Option<BetRecord>, LedgerError> {
        Ok(self.bets.read().bets.get(&bet_id).cloned())
    }

    fn pending_bets(&self) -> Result<Vec<BetRecord>, LedgerError> {
        let table = self.bets.read();
        let mut pending: Vec<BetRecord> = table.bets.values().filter(|r| r.is_pending()).cloned().collect();
        pending.sort_by_key(|r| r.bet.id);
        Ok(pending)
    }

    fn pending_bets_for_fixture(&self, fixture_id: &FixtureId) -> Result<Vec<BetRecord>, LedgerError> {
        let table = self.bets.read();
        let Some(ids) = table.pending_by_fixture.get(fixture_id) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| table.bets.get(id)).cloned().collect())
    }

    fn bets_for_fixture(&self, fixture_id: &FixtureId) -> Result<Vec<BetRecord>, LedgerError> {
        let table = self.bets.read();
        let mut records: Vec<BetRecord> = table
            .bets
            .values()
            .filter(|r| r.touches_fixture(fixture_id))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id());
        Ok(records)
    }

    fn pending_fixtures(&self) -> Result<Vec<FixtureId>, LedgerError> {
        Ok(self.bets.read().pending_by_fixture.keys().cloned().collect())
    }

    fn settlement_credit(&self, bet_id: BetId) -> Result<Option<Transaction>, LedgerError> {
        Ok(self.bets.read().credits.get(&bet_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::verify_replay;
    use crate::bet::{BetType, SelectionSpec};
    use crate::types::Odds;
    use rust_decimal_macros::dec;
    use std::thread;

    fn t0() -> Timestamp {
        Timestamp::from_millis(1_000)
    }

    fn draft(stake: i64, fixture: &str) -> BetDraft {
        BetDraft {
            bet_type: BetType::Single,
            stake: Cents::new(stake),
            total_odds: dec!(2.0000),
            potential_winnings: Cents::new(stake * 2),
            selections: vec![SelectionSpec::new(fixture, "1x2", "home", Odds::parse("2.00").unwrap())],
        }
    }

    fn funded(ledger: &InMemoryLedger, balance: i64) -> AccountId {
        ledger.open_account(Cents::new(balance), t0()).unwrap().id
    }

    fn assert_replays(ledger: &InMemoryLedger, account_id: AccountId) {
        let account = ledger.account(account_id).unwrap().unwrap();
        let log = ledger.transactions(account_id).unwrap();
        verify_replay(&account, &log).unwrap();
    }

    #[test]
    fn reservation_debits_every_stake() {
        let ledger = InMemoryLedger::new();
        let account = funded(&ledger, 10_000);

        let reservation = ledger
            .reserve_stake_and_create_bets(account, &[draft(2_000, "fx-1"), draft(3_000, "fx-2")], t0())
            .unwrap();

        assert_eq!(reservation.bets.len(), 2);
        assert_eq!(reservation.new_balance, Cents::new(5_000));
        assert_eq!(reservation.transactions[1].balance_before, Cents::new(8_000));
        assert_eq!(ledger.pending_fixtures().unwrap().len(), 2);
        assert_replays(&ledger, account);
    }

    #[test]
    fn reservation_is_all_or_nothing() {
        let ledger = InMemoryLedger::new();
        let account = funded(&ledger, 4_000);

        let err = ledger
            .reserve_stake_and_create_bets(account, &[draft(2_000, "fx-1"), draft(3_000, "fx-2")], t0())
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(ledger.account(account).unwrap().unwrap().balance, Cents::new(4_000));
        assert!(ledger.pending_bets().unwrap().is_empty());
        assert_eq!(ledger.transactions(account).unwrap().len(), 1);
    }

    #[test]
    fn winnings_credit_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let account = funded(&ledger, 5_000);
        let bet = ledger
            .reserve_stake_and_create_bets(account, &[draft(2_000, "fx-1")], t0())
            .unwrap()
            .bets[0]
            .id();

        let first = ledger.credit_winnings(bet, Cents::new(4_000), t0()).unwrap();
        let second = ledger.credit_winnings(bet, Cents::new(4_000), t0()).unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.account(account).unwrap().unwrap().balance, Cents::new(7_000));
        assert_replays(&ledger, account);
    }

    #[test]
    fn conflicting_second_credit_is_refused() {
        let ledger = InMemoryLedger::new();
        let account = funded(&ledger, 5_000);
        let bet = ledger
            .reserve_stake_and_create_bets(account, &[draft(2_000, "fx-1")], t0())
            .unwrap()
            .bets[0]
            .id();

        ledger.credit_winnings(bet, Cents::new(4_000), t0()).unwrap();
        let different_amount = ledger.credit_winnings(bet, Cents::new(4_100), t0());
        let refund_after_win = ledger.refund_stake(bet, t0());

        assert!(matches!(different_amount, Err(LedgerError::IdempotencyViolation { .. })));
        assert!(matches!(refund_after_win, Err(LedgerError::IdempotencyViolation { .. })));
        assert_eq!(ledger.account(account).unwrap().unwrap().balance, Cents::new(7_000));
    }

    #[test]
    fn credit_on_lost_bet_is_refused() {
        let ledger = InMemoryLedger::new();
        let account = funded(&ledger, 5_000);
        let bet = ledger
            .reserve_stake_and_create_bets(account, &[draft(2_000, "fx-1")], t0())
            .unwrap()
            .bets[0]
            .id();

        ledger.finalize_bet(bet, BetStatus::Lost, Cents::zero(), t0()).unwrap();
        assert!(matches!(
            ledger.refund_stake(bet, t0()),
            Err(LedgerError::IdempotencyViolation { .. })
        ));
    }

    #[test]
    fn finalize_is_compare_and_swap() {
        let ledger = InMemoryLedger::new();
        let account = funded(&ledger, 5_000);
        let bet = ledger
            .reserve_stake_and_create_bets(account, &[draft(2_000, "fx-1")], t0())
            .unwrap()
            .bets[0]
            .id();

        assert!(matches!(
            ledger.finalize_bet(bet, BetStatus::Pending, Cents::zero(), t0()),
            Err(LedgerError::InvalidTransition { .. })
        ));
        let first = ledger.finalize_bet(bet, BetStatus::Void, Cents::zero(), t0()).unwrap();
        let second = ledger.finalize_bet(bet, BetStatus::Won, Cents::new(1), t0()).unwrap();

        assert!(matches!(first, Finalized::Applied(_)));
        assert!(matches!(second, Finalized::AlreadyTerminal(_)));
        assert_eq!(second.record().bet.status, BetStatus::Void);
        assert!(ledger.pending_fixtures().unwrap().is_empty());
    }

    #[test]
    fn selection_status_is_write_once() {
        let ledger = InMemoryLedger::new();
        let account = funded(&ledger, 5_000);
        let record = ledger
            .reserve_stake_and_create_bets(account, &[draft(2_000, "fx-1")], t0())
            .unwrap()
            .bets
            .remove(0);
        let selection = record.selections[0].id;

        ledger.set_selection_status(selection, SelectionStatus::Won).unwrap();
        ledger.set_selection_status(selection, SelectionStatus::Won).unwrap();
        assert!(matches!(
            ledger.set_selection_status(selection, SelectionStatus::Lost),
            Err(LedgerError::SelectionAlreadySettled { .. })
        ));
    }

    #[test]
    fn stale_expected_balance_conflicts() {
        let ledger = InMemoryLedger::new();
        let account = funded(&ledger, 1_000);

        let err = ledger
            .adjust_balance(account, Cents::new(500), Some(Cents::new(900)), "bonus", t0())
            .unwrap_err();
        assert!(err.is_transient());

        ledger
            .adjust_balance(account, Cents::new(500), Some(Cents::new(1_000)), "bonus", t0())
            .unwrap();
        assert_eq!(ledger.account(account).unwrap().unwrap().balance, Cents::new(1_500));
        assert_replays(&ledger, account);
    }

    #[test]
    fn busy_account_times_out_as_conflict() {
        let ledger = InMemoryLedger::with_lock_timeout(Duration::from_millis(5));
        let account = funded(&ledger, 1_000);

        let handle = ledger.handle(account).unwrap();
        let _held = handle.lock();
        let err = ledger
            .reserve_stake_and_create_bets(account, &[draft(100, "fx-1")], t0())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[test]
    fn concurrent_reservations_never_overdraw() {
        let ledger = Arc::new(InMemoryLedger::with_lock_timeout(Duration::from_secs(5)));
        let account = funded(&ledger, 500);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    ledger
                        .reserve_stake_and_create_bets(account, &[draft(100, &format!("fx-{}", i))], t0())
                        .is_ok()
                })
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, 5);
        assert_eq!(ledger.account(account).unwrap().unwrap().balance, Cents::zero());
        assert_replays(&ledger, account);
    }
}
