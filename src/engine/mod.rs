// 8.0: wagering engine. coordinates bet placement, settlement, manual overrides,
// exposure tracking and reconciliation on top of the ledger store.
// the ledger is the only shared mutable resource; everything else here is derived from it.

mod core;
mod placement;
mod reconcile;
mod results;
mod settlement;

pub use self::core::{Collaborators, Engine};
pub use placement::validate_request;
pub use results::{
    EngineError, PlacementError, PlacementResult, ReconcileError, ReconcileReport, ResultState, SettleReport,
    SettlementError, SettlementSummary, SweepReport, ValidationError,
};
pub use settlement::ForcedOutcome;
