// wager-core: sportsbook wagering ledger.
// money-first architecture: the double-credit invariant and balance replay take priority.
// all arithmetic is integer cents and fixed-point odds, never floats.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: ids, Cents, Odds, Timestamp, Clock
//   2.x  bet.rs: bets, selections, placement request union
//   3.x  payout.rs: payout calculator, k-of-n enumeration, void leg policy
//   4.x  account.rs: account balance + transaction log, replay check
//   5.x  exposure.rs: per-outcome liability book, rebuild, drift
//   6.x  feed.rs: result feed + market service collaborators
//   7.x  audit.rs: operator audit trail
//   8.x  engine/: placement, settlement, manual override, reconciliation
//   10.x store/: ledger store trait, in-memory + sqlite backends
//   11.x reconciliation.rs: issue log, missing/duplicate/mismatch bookkeeping
//   12.x retry.rs: bounded exponential backoff
//   13.x config.rs: limits, timing, env presets, toml loading
//   14.x events.rs: state transition events
//   15.x worker.rs: supervised reconciliation loop on tokio

// core ledger modules
pub mod account;
pub mod bet;
pub mod engine;
pub mod events;
pub mod exposure;
pub mod payout;
pub mod store;
pub mod types;

// settlement and risk
pub mod reconciliation;
pub mod retry;

// integration modules
pub mod audit;
pub mod config;
pub mod feed;
pub mod worker;

// re exports for convenience
pub use account::*;
pub use bet::*;
pub use engine::*;
pub use events::*;
pub use exposure::*;
pub use payout::*;
pub use reconciliation::*;
pub use types::*;
pub use audit::{AuditAction, AuditEntry, AuditError, AuditLog, InMemoryAuditLog};
pub use config::{ConfigError, Environment, LedgerParams, PlacementLimits, ReconciliationParams, SettlementParams, WagerConfig};
pub use feed::{FeedError, Finality, FixtureResult, InMemoryMarketBoard, InMemoryResultFeed, MarketService, OutcomeResult, ResultFeed};
pub use retry::RetryPolicy;
pub use store::{Finalized, InMemoryLedger, LedgerError, LedgerStore, Reservation, SqliteLedger};
pub use worker::{ReconciliationWorker, WorkerError, WorkerHealth};
