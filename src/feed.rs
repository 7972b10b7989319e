// 6.0 feed.rs: contracts with the ingestion pipeline and the odds/market service.
// both live outside this crate. the in-memory versions back tests and the simulator.

use crate::bet::SelectionStatus;
use crate::types::{FixtureId, MarketKey, OutcomeKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Finality {
    Provisional,
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeResult {
    pub market_key: MarketKey,
    pub outcome_key: OutcomeKey,
    pub status: SelectionStatus,
}

impl OutcomeResult {
    pub fn new(market_key: impl Into<String>, outcome_key: impl Into<String>, status: SelectionStatus) -> Self {
        Self {
            market_key: MarketKey::new(market_key),
            outcome_key: OutcomeKey::new(outcome_key),
            status,
        }
    }
}

pub type OutcomeFingerprint = BTreeMap<(MarketKey, OutcomeKey), SelectionStatus>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureResult {
    pub fixture_id: FixtureId,
    pub outcomes: Vec<OutcomeResult>,
    pub finality: Finality,
}

impl FixtureResult {
    pub fn new(fixture_id: impl Into<String>, finality: Finality, outcomes: Vec<OutcomeResult>) -> Self {
        Self {
            fixture_id: FixtureId::new(fixture_id),
            outcomes,
            finality,
        }
    }

    pub fn is_final(&self) -> bool {
        self.finality == Finality::Final
    }

    /// Status for one outcome. `None` if unreported or reported with conflicting statuses.
    pub fn status_of(&self, market_key: &MarketKey, outcome_key: &OutcomeKey) -> Option<SelectionStatus> {
        let mut found: Option<SelectionStatus> = None;
        for o in self
            .outcomes
            .iter()
            .filter(|o| &o.market_key == market_key && &o.outcome_key == outcome_key)
        {
            match found {
                Some(existing) if existing != o.status => return None,
                _ => found = Some(o.status),
            }
        }
        found
    }

    /// Outcomes listed more than once with different statuses.
    pub fn conflicts(&self) -> Vec<(MarketKey, OutcomeKey)> {
        let mut seen: HashMap<(&MarketKey, &OutcomeKey), SelectionStatus> = HashMap::new();
        let mut conflicting: Vec<(MarketKey, OutcomeKey)> = Vec::new();
        for o in &self.outcomes {
            let key = (&o.market_key, &o.outcome_key);
            match seen.get(&key) {
                Some(status) if *status != o.status => {
                    let owned = (o.market_key.clone(), o.outcome_key.clone());
                    if !conflicting.contains(&owned) {
                        conflicting.push(owned);
                    }
                }
                Some(_) => {}
                None => {
                    seen.insert(key, o.status);
                }
            }
        }
        conflicting.sort();
        conflicting
    }

    /// Unambiguous outcome statuses, used to detect a result changing after it was applied.
    pub fn fingerprint(&self) -> OutcomeFingerprint {
        let conflicts = self.conflicts();
        self.outcomes
            .iter()
            .filter(|o| !conflicts.contains(&(o.market_key.clone(), o.outcome_key.clone())))
            .map(|o| ((o.market_key.clone(), o.outcome_key.clone()), o.status))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("feed unavailable: {0}")]
    Unavailable(String),

    #[error("feed returned malformed data: {0}")]
    Malformed(String),
}

/// Authoritative match results.
pub trait ResultFeed: Send + Sync {
    fn fixture_result(&self, fixture_id: &FixtureId) -> Result<Option<FixtureResult>, FeedError>;
}

/// Whether a market still accepts bets.
pub trait MarketService: Send + Sync {
    fn is_market_open(&self, fixture_id: &FixtureId, market_key: &MarketKey) -> Result<bool, FeedError>;
}

#[derive(Debug, Default)]
pub struct InMemoryResultFeed {
    results: RwLock<HashMap<FixtureId, FixtureResult>>,
    failing: RwLock<HashSet<FixtureId>>,
}

impl InMemoryResultFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, result: FixtureResult) {
        self.results.write().insert(result.fixture_id.clone(), result);
    }

    pub fn retract(&self, fixture_id: &FixtureId) {
        self.results.write().remove(fixture_id);
    }

    /// Makes lookups for this fixture fail until `recover` is called.
    pub fn fail(&self, fixture_id: &FixtureId) {
        self.failing.write().insert(fixture_id.clone());
    }

    pub fn recover(&self, fixture_id: &FixtureId) {
        self.failing.write().remove(fixture_id);
    }
}

impl ResultFeed for InMemoryResultFeed {
    fn fixture_result(&self, fixture_id: &FixtureId) -> Result<Option<FixtureResult>, FeedError> {
        if self.failing.read().contains(fixture_id) {
            return Err(FeedError::Unavailable(format!("fixture {} lookup failed", fixture_id)));
        }
        Ok(self.results.read().get(fixture_id).cloned())
    }
}

/// Every market is open unless suspended.
#[derive(Debug, Default)]
pub struct InMemoryMarketBoard {
    suspended: RwLock<HashSet<(FixtureId, MarketKey)>>,
    closed_fixtures: RwLock<HashSet<FixtureId>>,
}

impl InMemoryMarketBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self, fixture_id: &FixtureId, market_key: &MarketKey) {
        self.suspended.write().insert((fixture_id.clone(), market_key.clone()));
    }

    pub fn reopen(&self, fixture_id: &FixtureId, market_key: &MarketKey) {
        self.suspended.write().remove(&(fixture_id.clone(), market_key.clone()));
    }

    /// Closes every market on a fixture, e.g. at kick-off.
    pub fn close_fixture(&self, fixture_id: &FixtureId) {
        self.closed_fixtures.write().insert(fixture_id.clone());
    }
}

impl MarketService for InMemoryMarketBoard {
    fn is_market_open(&self, fixture_id: &FixtureId, market_key: &MarketKey) -> Result<bool, FeedError> {
        if self.closed_fixtures.read().contains(fixture_id) {
            return Ok(false);
        }
        Ok(!self
            .suspended
            .read()
            .contains(&(fixture_id.clone(), market_key.clone())))
    }
}
