//! Bets, selections and the placement request boundary.
//!
//! A placement arrives as a [`PlacementRequest`], a closed tagged union that
//! rejects unknown shapes during deserialization. The ledger turns it into one
//! or more [`BetDraft`]s and stores them as [`BetRecord`]s.

use crate::types::{
    AccountId, BetId, Cents, FixtureId, MarketKey, Odds, OutcomeKey, SelectionId, Timestamp,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_SYSTEM_FOLD: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BetType {
    Single,
    Combination,
    /// k-of-n: stake is split evenly across every `fold`-sized combination.
    System { fold: u8 },
}

impl BetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetType::Single => "single",
            BetType::Combination => "combination",
            BetType::System { .. } => "system",
        }
    }

    pub fn fold(&self) -> Option<u8> {
        match self {
            BetType::System { fold } => Some(*fold),
            _ => None,
        }
    }
}

impl fmt::Display for BetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetType::System { fold } => write!(f, "system({})", fold),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Pending,
    Won,
    Lost,
    Void,
    Cashout,
    Cancelled,
}

impl BetStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BetStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Pending => "pending",
            BetStatus::Won => "won",
            BetStatus::Lost => "lost",
            BetStatus::Void => "void",
            BetStatus::Cashout => "cashout",
            BetStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(BetStatus::Pending),
            "won" => Some(BetStatus::Won),
            "lost" => Some(BetStatus::Lost),
            "void" => Some(BetStatus::Void),
            "cashout" => Some(BetStatus::Cashout),
            "cancelled" => Some(BetStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStatus {
    Pending,
    Won,
    Lost,
    Void,
}

impl SelectionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SelectionStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStatus::Pending => "pending",
            SelectionStatus::Won => "won",
            SelectionStatus::Lost => "lost",
            SelectionStatus::Void => "void",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SelectionStatus::Pending),
            "won" => Some(SelectionStatus::Won),
            "lost" => Some(SelectionStatus::Lost),
            "void" => Some(SelectionStatus::Void),
            _ => None,
        }
    }
}

impl fmt::Display for SelectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub id: SelectionId,
    pub bet_id: BetId,
    pub fixture_id: FixtureId,
    pub market_key: MarketKey,
    pub outcome_key: OutcomeKey,
    pub odds: Odds,
    pub status: SelectionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub id: BetId,
    pub account_id: AccountId,
    pub bet_type: BetType,
    pub stake: Cents,
    /// Product of leg odds, 4 fractional digits. Display value; payouts use the exact product.
    pub total_odds: Decimal,
    pub potential_winnings: Cents,
    pub actual_winnings: Cents,
    pub status: BetStatus,
    pub placed_at: Timestamp,
    pub settled_at: Option<Timestamp>,
}

/// A bet together with its selections, the unit the ledger reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetRecord {
    pub bet: Bet,
    pub selections: Vec<Selection>,
}

impl BetRecord {
    pub fn id(&self) -> BetId {
        self.bet.id
    }

    pub fn is_pending(&self) -> bool {
        self.bet.status == BetStatus::Pending
    }

    pub fn touches_fixture(&self, fixture_id: &FixtureId) -> bool {
        self.selections.iter().any(|s| &s.fixture_id == fixture_id)
    }

    pub fn odds(&self) -> Vec<Odds> {
        self.selections.iter().map(|s| s.odds).collect()
    }

    pub fn legs(&self) -> Vec<(Odds, SelectionStatus)> {
        self.selections.iter().map(|s| (s.odds, s.status)).collect()
    }

    pub fn all_selections_terminal(&self) -> bool {
        self.selections.iter().all(|s| s.status.is_terminal())
    }
}

/// One leg of a placement request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SelectionSpec {
    pub fixture_id: FixtureId,
    pub market_key: MarketKey,
    pub outcome_key: OutcomeKey,
    #[serde(rename = "oddsDecimal")]
    pub odds: Odds,
}

impl SelectionSpec {
    pub fn new(
        fixture_id: impl Into<String>,
        market_key: impl Into<String>,
        outcome_key: impl Into<String>,
        odds: Odds,
    ) -> Self {
        Self {
            fixture_id: FixtureId::new(fixture_id),
            market_key: MarketKey::new(market_key),
            outcome_key: OutcomeKey::new(outcome_key),
            odds,
        }
    }
}

/// N independent singles. Each selection becomes its own bet staked `stake`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SinglesRequest {
    pub account_id: AccountId,
    #[serde(rename = "stakeCents", alias = "totalStakeCents")]
    pub stake: Cents,
    pub selections: Vec<SelectionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CombinationRequest {
    pub account_id: AccountId,
    #[serde(rename = "totalStakeCents")]
    pub stake: Cents,
    pub selections: Vec<SelectionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SystemRequest {
    pub account_id: AccountId,
    #[serde(rename = "totalStakeCents")]
    pub stake: Cents,
    #[serde(default = "default_fold")]
    pub fold: u8,
    pub selections: Vec<SelectionSpec>,
}

fn default_fold() -> u8 {
    DEFAULT_SYSTEM_FOLD
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlacementRequest {
    Single(SinglesRequest),
    Combination(CombinationRequest),
    System(SystemRequest),
}

impl PlacementRequest {
    pub fn singles(account_id: AccountId, stake: Cents, selections: Vec<SelectionSpec>) -> Self {
        PlacementRequest::Single(SinglesRequest {
            account_id,
            stake,
            selections,
        })
    }

    pub fn combination(account_id: AccountId, stake: Cents, selections: Vec<SelectionSpec>) -> Self {
        PlacementRequest::Combination(CombinationRequest {
            account_id,
            stake,
            selections,
        })
    }

    pub fn system(account_id: AccountId, stake: Cents, fold: u8, selections: Vec<SelectionSpec>) -> Self {
        PlacementRequest::System(SystemRequest {
            account_id,
            stake,
            fold,
            selections,
        })
    }

    pub fn account_id(&self) -> AccountId {
        match self {
            PlacementRequest::Single(r) => r.account_id,
            PlacementRequest::Combination(r) => r.account_id,
            PlacementRequest::System(r) => r.account_id,
        }
    }

    /// Stake of each bet the request produces.
    pub fn stake(&self) -> Cents {
        match self {
            PlacementRequest::Single(r) => r.stake,
            PlacementRequest::Combination(r) => r.stake,
            PlacementRequest::System(r) => r.stake,
        }
    }

    pub fn selections(&self) -> &[SelectionSpec] {
        match self {
            PlacementRequest::Single(r) => &r.selections,
            PlacementRequest::Combination(r) => &r.selections,
            PlacementRequest::System(r) => &r.selections,
        }
    }

    pub fn bet_type(&self) -> BetType {
        match self {
            PlacementRequest::Single(_) => BetType::Single,
            PlacementRequest::Combination(_) => BetType::Combination,
            PlacementRequest::System(r) => BetType::System { fold: r.fold },
        }
    }
}

/// A bet the ledger has not stored yet. Ids are assigned on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetDraft {
    pub bet_type: BetType,
    pub stake: Cents,
    pub total_odds: Decimal,
    pub potential_winnings: Cents,
    pub selections: Vec<SelectionSpec>,
}
