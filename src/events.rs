// 14.0: every state change produces an event. used for audit trails, tests, and as the hook
// for pushing updates to clients. the EventPayload enum lists all event types.

use crate::account::TransactionKind;
use crate::bet::{BetStatus, BetType, SelectionStatus};
use crate::exposure::ExposureKey;
use crate::reconciliation::{IssueType, Severity};
use crate::types::{AccountId, ActorId, BetId, Cents, FixtureId, IssueId, SelectionId, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_EVENTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    // Placement
    BetPlaced(BetPlacedEvent),
    StakeReserved(StakeReservedEvent),

    // Settlement
    SelectionSettled(SelectionSettledEvent),
    BetSettled(BetSettledEvent),
    WinningsCredited(CreditEvent),
    StakeRefunded(CreditEvent),
    SettlementHalted(SettlementHaltedEvent),

    // Manual actions
    ForcedSettlement(ForcedSettlementEvent),
    CashedOut(CashedOutEvent),
    BalanceAdjusted(BalanceAdjustedEvent),

    // Risk
    ExposureUpdated(ExposureUpdatedEvent),

    // Reconciliation
    IssueRaised(IssueRaisedEvent),
    IssueResolved(IssueResolvedEvent),
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::BetPlaced(_) => "bet_placed",
            EventPayload::StakeReserved(_) => "stake_reserved",
            EventPayload::SelectionSettled(_) => "selection_settled",
            EventPayload::BetSettled(_) => "bet_settled",
            EventPayload::WinningsCredited(_) => "winnings_credited",
            EventPayload::StakeRefunded(_) => "stake_refunded",
            EventPayload::SettlementHalted(_) => "settlement_halted",
            EventPayload::ForcedSettlement(_) => "forced_settlement",
            EventPayload::CashedOut(_) => "cashed_out",
            EventPayload::BalanceAdjusted(_) => "balance_adjusted",
            EventPayload::ExposureUpdated(_) => "exposure_updated",
            EventPayload::IssueRaised(_) => "issue_raised",
            EventPayload::IssueResolved(_) => "issue_resolved",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetPlacedEvent {
    pub bet_id: BetId,
    pub account_id: AccountId,
    pub bet_type: BetType,
    pub stake: Cents,
    pub potential_winnings: Cents,
    pub selections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeReservedEvent {
    pub account_id: AccountId,
    pub bet_ids: Vec<BetId>,
    pub total_stake: Cents,
    pub new_balance: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSettledEvent {
    pub selection_id: SelectionId,
    pub bet_id: BetId,
    pub fixture_id: FixtureId,
    pub status: SelectionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetSettledEvent {
    pub bet_id: BetId,
    pub account_id: AccountId,
    pub status: BetStatus,
    pub actual_winnings: Cents,
}

/// Winnings or refund landing on an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditEvent {
    pub bet_id: BetId,
    pub account_id: AccountId,
    pub transaction_id: TransactionId,
    pub kind: TransactionKind,
    pub amount: Cents,
    pub new_balance: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementHaltedEvent {
    pub bet_id: BetId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForcedSettlementEvent {
    pub bet_id: BetId,
    pub actor_id: ActorId,
    pub status: BetStatus,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashedOutEvent {
    pub bet_id: BetId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub amount: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceAdjustedEvent {
    pub account_id: AccountId,
    pub transaction_id: TransactionId,
    pub amount: Cents,
    pub new_balance: Cents,
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureUpdatedEvent {
    pub key: ExposureKey,
    pub liability: Cents,
    pub bet_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRaisedEvent {
    pub issue_id: IssueId,
    pub fixture_id: FixtureId,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub affected_bets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueResolvedEvent {
    pub issue_id: IssueId,
    pub fixture_id: FixtureId,
    pub issue_type: IssueType,
    pub resolved_by: Option<ActorId>,
}

pub trait EventEmitter {
    fn emit(&mut self, event: Event);
}

/// Keeps the most recent `max_events` events; older ones are dropped.
#[derive(Debug)]
pub struct EventCollector {
    events: Vec<Event>,
    next_id: u64,
    max_events: usize,
    dropped: u64,
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: Vec::new(),
            next_id: 1,
            max_events: max_events.max(1),
            dropped: 0,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn next_id(&mut self) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Assigns an id and emits in one step.
    pub fn record(&mut self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let id = self.next_id();
        self.emit(Event::new(id, timestamp, payload));
        id
    }

    /// Events dropped because the collector was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl EventEmitter for EventCollector {
    fn emit(&mut self, event: Event) {
        self.events.push(event);
        if self.events.len() > self.max_events {
            let excess = self.events.len() - self.max_events;
            self.events.drain(..excess);
            self.dropped += excess as u64;
        }
    }
}
