// 10.3 sqlite.rs: durable ledger on SQLite.
// every write runs inside BEGIN IMMEDIATE so the balance read and the row writes commit together.
// a partial unique index on transactions(bet_id) is the last line against a double settlement credit.

use super::{check_existing_credit, check_finalize_target, Finalized, LedgerError, LedgerStore, Reservation};
use crate::account::{Account, Transaction, TransactionKind, TransactionRef};
use crate::bet::{Bet, BetDraft, BetRecord, BetStatus, BetType, Selection, SelectionStatus};
use crate::types::{AccountId, BetId, Cents, FixtureId, MarketKey, Odds, OutcomeKey, SelectionId, Timestamp, TransactionId};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    balance INTEGER NOT NULL CHECK (balance >= 0),
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL,
    balance_before INTEGER NOT NULL,
    balance_after INTEGER NOT NULL,
    ref_type TEXT NOT NULL,
    ref_value TEXT NOT NULL,
    bet_id INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id, id);
CREATE UNIQUE INDEX IF NOT EXISTS ux_settlement_credit ON transactions(bet_id)
    WHERE kind IN ('winnings', 'refund');
CREATE TABLE IF NOT EXISTS bets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    bet_type TEXT NOT NULL,
    fold INTEGER,
    stake INTEGER NOT NULL,
    total_odds TEXT NOT NULL,
    potential_winnings INTEGER NOT NULL,
    actual_winnings INTEGER NOT NULL,
    status TEXT NOT NULL,
    placed_at INTEGER NOT NULL,
    settled_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_bets_status ON bets(status);
CREATE TABLE IF NOT EXISTS selections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bet_id INTEGER NOT NULL REFERENCES bets(id),
    fixture_id TEXT NOT NULL,
    market_key TEXT NOT NULL,
    outcome_key TEXT NOT NULL,
    odds TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_selections_bet ON selections(bet_id);
CREATE INDEX IF NOT EXISTS idx_selections_fixture ON selections(fixture_id);
";

const TX_COLUMNS: &str =
    "id, account_id, kind, amount, balance_before, balance_after, ref_type, ref_value, created_at";

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation
                ) =>
            {
                LedgerError::Conflict(err.to_string())
            }
            _ => LedgerError::Backend(err.to_string()),
        }
    }
}

pub struct SqliteLedger {
    conn: Mutex<Connection>,
    lock_timeout: Duration,
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn, lock_timeout)
    }

    pub fn open_in_memory(lock_timeout: Duration) -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?, lock_timeout)
    }

    fn init(conn: Connection, lock_timeout: Duration) -> Result<Self, LedgerError> {
        conn.busy_timeout(lock_timeout)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lock_timeout,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| LedgerError::Conflict("sqlite connection is busy".to_string()))
    }
}

fn bad_column(index: usize, value: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, format!("unexpected value {}", value).into())
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let kind: String = row.get(2)?;
    let ref_type: String = row.get(6)?;
    let ref_value: String = row.get(7)?;
    let reference = match ref_type.as_str() {
        "bet" => TransactionRef::Bet(BetId(ref_value.parse().map_err(|_| bad_column(7, &ref_value))?)),
        _ => TransactionRef::External(ref_value),
    };
    Ok(Transaction {
        id: TransactionId(row.get::<_, i64>(0)? as u64),
        account_id: AccountId(row.get::<_, i64>(1)? as u64),
        kind: TransactionKind::parse(&kind).ok_or_else(|| bad_column(2, &kind))?,
        amount: Cents::new(row.get(3)?),
        balance_before: Cents::new(row.get(4)?),
        balance_after: Cents::new(row.get(5)?),
        reference,
        created_at: Timestamp::from_millis(row.get(8)?),
    })
}

fn bet_from_row(row: &Row<'_>) -> rusqlite::Result<Bet> {
    let bet_type: String = row.get(2)?;
    let fold: Option<i64> = row.get(3)?;
    let bet_type = match (bet_type.as_str(), fold) {
        ("single", _) => BetType::Single,
        ("combination", _) => BetType::Combination,
        ("system", Some(fold)) => BetType::System {
            fold: u8::try_from(fold).map_err(|_| bad_column(3, fold))?,
        },
        _ => return Err(bad_column(2, &bet_type)),
    };
    let total_odds: String = row.get(5)?;
    let status: String = row.get(8)?;
    Ok(Bet {
        id: BetId(row.get::<_, i64>(0)? as u64),
        account_id: AccountId(row.get::<_, i64>(1)? as u64),
        bet_type,
        stake: Cents::new(row.get(4)?),
        total_odds: Decimal::from_str(&total_odds).map_err(|_| bad_column(5, &total_odds))?,
        potential_winnings: Cents::new(row.get(6)?),
        actual_winnings: Cents::new(row.get(7)?),
        status: BetStatus::parse(&status).ok_or_else(|| bad_column(8, &status))?,
        placed_at: Timestamp::from_millis(row.get(9)?),
        settled_at: row.get::<_, Option<i64>>(10)?.map(Timestamp::from_millis),
    })
}

fn selection_from_row(row: &Row<'_>) -> rusqlite::Result<Selection> {
    let odds: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(Selection {
        id: SelectionId(row.get::<_, i64>(0)? as u64),
        bet_id: BetId(row.get::<_, i64>(1)? as u64),
        fixture_id: FixtureId::new(row.get::<_, String>(2)?),
        market_key: MarketKey::new(row.get::<_, String>(3)?),
        outcome_key: OutcomeKey::new(row.get::<_, String>(4)?),
        odds: Odds::parse(&odds).map_err(|_| bad_column(5, &odds))?,
        status: SelectionStatus::parse(&status).ok_or_else(|| bad_column(6, &status))?,
    })
}

fn load_bet(conn: &Connection, bet_id: BetId) -> Result<Option<BetRecord>, LedgerError> {
    let bet = conn
        .query_row(
            "SELECT id, account_id, bet_type, fold, stake, total_odds, potential_winnings,
                    actual_winnings, status, placed_at, settled_at
             FROM bets WHERE id = ?1",
            params![bet_id.0 as i64],
            bet_from_row,
        )
        .optional()?;
    let Some(bet) = bet else {
        return Ok(None);
    };
    let mut stmt = conn.prepare_cached(
        "SELECT id, bet_id, fixture_id, market_key, outcome_key, odds, status
         FROM selections WHERE bet_id = ?1 ORDER BY id",
    )?;
    let selections = stmt
        .query_map(params![bet_id.0 as i64], selection_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Some(BetRecord { bet, selections }))
}

fn load_bets(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<BetRecord>, LedgerError> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(args, |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(record) = load_bet(conn, BetId(id as u64))? {
            records.push(record);
        }
    }
    Ok(records)
}

fn load_balance(conn: &Connection, account_id: AccountId) -> Result<Cents, LedgerError> {
    conn.query_row(
        "SELECT balance FROM accounts WHERE id = ?1",
        params![account_id.0 as i64],
        |row| row.get::<_, i64>(0),
    )
    .optional()?
    .map(Cents::new)
    .ok_or(LedgerError::AccountNotFound(account_id))
}

fn load_credit(conn: &Connection, bet_id: BetId) -> Result<Option<Transaction>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE bet_id = ?1 AND kind IN ('winnings', 'refund')",
        TX_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![bet_id.0 as i64], transaction_from_row)
        .optional()?)
}

// must run inside an open transaction.
fn append_transaction(
    conn: &Connection,
    account_id: AccountId,
    kind: TransactionKind,
    amount: Cents,
    reference: TransactionRef,
    at: Timestamp,
) -> Result<Transaction, LedgerError> {
    let mut account = Account::new(account_id, at);
    account.balance = load_balance(conn, account_id)?;
    let (before, after) = account.apply(amount).map_err(|e| match e {
        crate::account::AccountError::InsufficientFunds { requested, available } => LedgerError::InsufficientFunds {
            account_id,
            requested,
            available,
        },
        crate::account::AccountError::Overflow => LedgerError::Overflow,
    })?;
    conn.execute(
        "UPDATE accounts SET balance = ?1 WHERE id = ?2",
        params![after.value(), account_id.0 as i64],
    )?;
    let (ref_type, ref_value, bet_id) = match &reference {
        TransactionRef::Bet(id) => ("bet", id.0.to_string(), Some(id.0 as i64)),
        TransactionRef::External(value) => ("external", value.clone(), None),
    };
    conn.execute(
        "INSERT INTO transactions
            (account_id, kind, amount, balance_before, balance_after, ref_type, ref_value, bet_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            account_id.0 as i64,
            kind.as_str(),
            amount.value(),
            before.value(),
            after.value(),
            ref_type,
            ref_value,
            bet_id,
            at.as_millis()
        ],
    )?;
    Ok(Transaction {
        id: TransactionId(conn.last_insert_rowid() as u64),
        account_id,
        kind,
        amount,
        balance_before: before,
        balance_after: after,
        reference,
        created_at: at,
    })
}

fn insert_bet(conn: &Connection, account_id: AccountId, draft: &BetDraft, placed_at: Timestamp) -> Result<BetId, LedgerError> {
    conn.execute(
        "INSERT INTO bets
            (account_id, bet_type, fold, stake, total_odds, potential_winnings, actual_winnings, status, placed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'pending', ?7)",
        params![
            account_id.0 as i64,
            draft.bet_type.as_str(),
            draft.bet_type.fold().map(i64::from),
            draft.stake.value(),
            draft.total_odds.to_string(),
            draft.potential_winnings.value(),
            placed_at.as_millis()
        ],
    )?;
    let bet_id = BetId(conn.last_insert_rowid() as u64);
    let mut stmt = conn.prepare_cached(
        "INSERT INTO selections (bet_id, fixture_id, market_key, outcome_key, odds, status)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
    )?;
    for spec in &draft.selections {
        stmt.execute(params![
            bet_id.0 as i64,
            spec.fixture_id.as_str(),
            spec.market_key.as_str(),
            spec.outcome_key.as_str(),
            spec.odds.to_string()
        ])?;
    }
    Ok(bet_id)
}

impl SqliteLedger {
    fn settle_credit(
        &self,
        bet_id: BetId,
        kind: TransactionKind,
        amount: Option<Cents>,
        at: Timestamp,
    ) -> Result<Transaction, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = load_bet(&tx, bet_id)?.ok_or(LedgerError::BetNotFound(bet_id))?;
        let amount = amount.unwrap_or(record.bet.stake);
        if !amount.is_positive() {
            return Err(LedgerError::NonPositiveAmount(amount));
        }
        if let Some(existing) = load_credit(&tx, bet_id)? {
            check_existing_credit(bet_id, &existing, kind, amount)?;
            debug!(bet_id = %bet_id, kind = %kind, "settlement credit already applied");
            return Ok(existing);
        }
        if record.bet.status.is_terminal() {
            return Err(LedgerError::IdempotencyViolation {
                bet_id,
                existing: format!("bet already {}", record.bet.status),
                attempted_kind: kind,
                attempted_amount: amount,
            });
        }
        let credit = append_transaction(&tx, record.bet.account_id, kind, amount, TransactionRef::Bet(bet_id), at)?;
        tx.commit()?;
        Ok(credit)
    }
}

impl LedgerStore for SqliteLedger {
    fn open_account(&self, opening_balance: Cents, at: Timestamp) -> Result<Account, LedgerError> {
        if opening_balance.is_negative() {
            return Err(LedgerError::NonPositiveAmount(opening_balance));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO accounts (balance, created_at) VALUES (0, ?1)",
            params![at.as_millis()],
        )?;
        let mut account = Account::new(AccountId(tx.last_insert_rowid() as u64), at);
        if opening_balance.is_positive() {
            let opening = append_transaction(
                &tx,
                account.id,
                TransactionKind::Adjustment,
                opening_balance,
                TransactionRef::External("opening-balance".to_string()),
                at,
            )?;
            account.balance = opening.balance_after;
        }
        tx.commit()?;
        Ok(account)
    }

    fn account(&self, account_id: AccountId) -> Result<Option<Account>, LedgerError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, balance, created_at FROM accounts WHERE id = ?1",
                params![account_id.0 as i64],
                |row| {
                    Ok(Account {
                        id: AccountId(row.get::<_, i64>(0)? as u64),
                        balance: Cents::new(row.get(1)?),
                        created_at: Timestamp::from_millis(row.get(2)?),
                    })
                },
            )
            .optional()?)
    }

    fn account_ids(&self) -> Result<Vec<AccountId>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM accounts ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|id| AccountId(id as u64)))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn transactions(&self, account_id: AccountId) -> Result<Vec<Transaction>, LedgerError> {
        let conn = self.conn()?;
        load_balance(&conn, account_id)?;
        let sql = format!("SELECT {} FROM transactions WHERE account_id = ?1 ORDER BY id", TX_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let log = stmt
            .query_map(params![account_id.0 as i64], transaction_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
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
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let balance = load_balance(&tx, account_id)?;
        if let Some(expected) = expected_balance {
            if balance != expected {
                return Err(LedgerError::Conflict(format!(
                    "account {} balance is {}, expected {}",
                    account_id, balance, expected
                )));
            }
        }
        let entry = append_transaction(
            &tx,
            account_id,
            TransactionKind::Adjustment,
            amount,
            TransactionRef::External(reference.to_string()),
            at,
        )?;
        tx.commit()?;
        Ok(entry)
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

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let balance = load_balance(&tx, account_id)?;
        if balance < total {
            return Err(LedgerError::InsufficientFunds {
                account_id,
                requested: total,
                available: balance,
            });
        }

        // dropping `tx` on any error below rolls everything back
        let mut bet_ids = Vec::with_capacity(drafts.len());
        let mut transactions = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let bet_id = insert_bet(&tx, account_id, draft, placed_at)?;
            transactions.push(append_transaction(
                &tx,
                account_id,
                TransactionKind::Stake,
                draft.stake.negate(),
                TransactionRef::Bet(bet_id),
                placed_at,
            )?);
            bet_ids.push(bet_id);
        }
        let mut bets = Vec::with_capacity(bet_ids.len());
        for bet_id in bet_ids {
            bets.push(load_bet(&tx, bet_id)?.ok_or(LedgerError::BetNotFound(bet_id))?);
        }
        let new_balance = load_balance(&tx, account_id)?;
        tx.commit()?;

        Ok(Reservation {
            bets,
            transactions,
            new_balance,
        })
    }

    fn credit_winnings(&self, bet_id: BetId, amount: Cents, at: Timestamp) -> Result<Transaction, LedgerError> {
        self.settle_credit(bet_id, TransactionKind::Winnings, Some(amount), at)
    }

    fn refund_stake(&self, bet_id: BetId, at: Timestamp) -> Result<Transaction, LedgerError> {
        self.settle_credit(bet_id, TransactionKind::Refund, None, at)
    }

    fn finalize_bet(
        &self,
        bet_id: BetId,
        status: BetStatus,
        actual_winnings: Cents,
        settled_at: Timestamp,
    ) -> Result<Finalized, LedgerError> {
        check_finalize_target(bet_id, status)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE bets SET status = ?1, actual_winnings = ?2, settled_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![status.as_str(), actual_winnings.value(), settled_at.as_millis(), bet_id.0 as i64],
        )?;
        let record = load_bet(&tx, bet_id)?.ok_or(LedgerError::BetNotFound(bet_id))?;
        tx.commit()?;
        Ok(if changed == 1 {
            Finalized::Applied(record)
        } else {
            Finalized::AlreadyTerminal(record)
        })
    }

    fn set_selection_status(
        &self,
        selection_id: SelectionId,
        status: SelectionStatus,
    ) -> Result<Selection, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut selection = tx
            .query_row(
                "SELECT id, bet_id, fixture_id, market_key, outcome_key, odds, status
                 FROM selections WHERE id = ?1",
                params![selection_id.0 as i64],
                selection_from_row,
            )
            .optional()?
            .ok_or(LedgerError::SelectionNotFound(selection_id))?;
        if selection.status == status {
            return Ok(selection);
        }
        if selection.status.is_terminal() {
            return Err(LedgerError::SelectionAlreadySettled {
                selection_id,
                current: selection.status,
                attempted: status,
            });
        }
        tx.execute(
            "UPDATE selections SET status = ?1 WHERE id = ?2",
            params![status.as_str(), selection_id.0 as i64],
        )?;
        tx.commit()?;
        selection.status = status;
        Ok(selection)
    }

    fn bet(&self, bet_id: BetId) -> Result<Option<BetRecord>, LedgerError> {
        let conn = self.conn()?;
        load_bet(&conn, bet_id)
    }

    fn pending_bets(&self) -> Result<Vec<BetRecord>, LedgerError> {
        let conn = self.conn()?;
        load_bets(&conn, "SELECT id FROM bets WHERE status = 'pending' ORDER BY id", params![])
    }

    fn pending_bets_for_fixture(&self, fixture_id: &FixtureId) -> Result<Vec<BetRecord>, LedgerError> {
        let conn = self.conn()?;
        load_bets(
            &conn,
            "SELECT DISTINCT b.id FROM bets b JOIN selections s ON s.bet_id = b.id
             WHERE b.status = 'pending' AND s.fixture_id = ?1 ORDER BY b.id",
            params![fixture_id.as_str()],
        )
    }

    fn bets_for_fixture(&self, fixture_id: &FixtureId) -> Result<Vec<BetRecord>, LedgerError> {
        let conn = self.conn()?;
        load_bets(
            &conn,
            "SELECT DISTINCT b.id FROM bets b JOIN selections s ON s.bet_id = b.id
             WHERE s.fixture_id = ?1 ORDER BY b.id",
            params![fixture_id.as_str()],
        )
    }

    fn pending_fixtures(&self) -> Result<Vec<FixtureId>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT s.fixture_id FROM selections s JOIN bets b ON s.bet_id = b.id
             WHERE b.status = 'pending' ORDER BY s.fixture_id",
        )?;
        let fixtures = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(FixtureId::new))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(fixtures)
    }

    fn settlement_credit(&self, bet_id: BetId) -> Result<Option<Transaction>, LedgerError> {
        let conn = self.conn()?;
        load_credit(&conn, bet_id)
    }
}
