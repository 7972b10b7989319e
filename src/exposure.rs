//! Exposure aggregation.
//!
//! Tracks, per market outcome, the sum of contingent liabilities across every
//! pending bet. The book remembers each bet's contributions so removal is exact
//! and idempotent, and can always be rebuilt from the pending bet set; the two
//! must agree to the cent.

use crate::bet::BetRecord;
use crate::payout::{leg_liabilities, PayoutError};
use crate::types::{BetId, Cents, FixtureId, MarketKey, OutcomeKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExposureKey {
    pub fixture_id: FixtureId,
    pub market_key: MarketKey,
    pub outcome_key: OutcomeKey,
}

impl ExposureKey {
    pub fn new(
        fixture_id: impl Into<String>,
        market_key: impl Into<String>,
        outcome_key: impl Into<String>,
    ) -> Self {
        Self {
            fixture_id: FixtureId::new(fixture_id),
            market_key: MarketKey::new(market_key),
            outcome_key: OutcomeKey::new(outcome_key),
        }
    }
}

impl fmt::Display for ExposureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.fixture_id, self.market_key, self.outcome_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureEntry {
    pub key: ExposureKey,
    pub liability: Cents,
    pub bet_count: usize,
}

/// Liability contributions of one bet, keyed by outcome.
pub fn contributions(record: &BetRecord) -> Result<Vec<(ExposureKey, Cents)>, PayoutError> {
    let liabilities = leg_liabilities(record.bet.bet_type, record.bet.stake, &record.odds())?;
    Ok(record
        .selections
        .iter()
        .zip(liabilities)
        .map(|(s, liability)| {
            (
                ExposureKey {
                    fixture_id: s.fixture_id.clone(),
                    market_key: s.market_key.clone(),
                    outcome_key: s.outcome_key.clone(),
                },
                liability,
            )
        })
        .collect())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Slot {
    liability: Cents,
    bet_count: usize,
}

#[derive(Debug, Default, Clone)]
pub struct ExposureBook {
    entries: BTreeMap<ExposureKey, Slot>,
    by_bet: HashMap<BetId, Vec<(ExposureKey, Cents)>>,
}

impl ExposureBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pending bet. Adding the same bet twice is a no-op.
    pub fn add_bet(&mut self, record: &BetRecord) -> Result<Vec<ExposureKey>, PayoutError> {
        if self.by_bet.contains_key(&record.bet.id) {
            return Ok(Vec::new());
        }
        let contribs = contributions(record)?;
        let touched = contribs.iter().map(|(k, _)| k.clone()).collect();
        for (key, liability) in &contribs {
            let slot = self.entries.entry(key.clone()).or_default();
            slot.liability = Cents::new(slot.liability.value() + liability.value());
            slot.bet_count += 1;
        }
        self.by_bet.insert(record.bet.id, contribs);
        Ok(touched)
    }

    /// Removes whatever the bet contributed. Unknown or already removed bets are ignored.
    pub fn remove_bet(&mut self, bet_id: BetId) -> Vec<ExposureKey> {
        let Some(contribs) = self.by_bet.remove(&bet_id) else {
            return Vec::new();
        };
        let mut touched = Vec::with_capacity(contribs.len());
        for (key, liability) in contribs {
            if let Some(slot) = self.entries.get_mut(&key) {
                slot.liability = Cents::new(slot.liability.value() - liability.value());
                slot.bet_count = slot.bet_count.saturating_sub(1);
                if slot.bet_count == 0 {
                    self.entries.remove(&key);
                }
            }
            touched.push(key);
        }
        touched
    }

    pub fn contains_bet(&self, bet_id: BetId) -> bool {
        self.by_bet.contains_key(&bet_id)
    }

    pub fn liability(&self, key: &ExposureKey) -> Cents {
        self.entries.get(key).map(|s| s.liability).unwrap_or_default()
    }

    pub fn entry(&self, key: &ExposureKey) -> Option<ExposureEntry> {
        self.entries.get(key).map(|s| ExposureEntry {
            key: key.clone(),
            liability: s.liability,
            bet_count: s.bet_count,
        })
    }

    pub fn entries(&self) -> Vec<ExposureEntry> {
        self.entries
            .iter()
            .map(|(key, s)| ExposureEntry {
                key: key.clone(),
                liability: s.liability,
                bet_count: s.bet_count,
            })
            .collect()
    }

    pub fn for_fixture(&self, fixture_id: &FixtureId) -> Vec<ExposureEntry> {
        self.entries()
            .into_iter()
            .filter(|e| &e.key.fixture_id == fixture_id)
            .collect()
    }

    /// Highest single-outcome liability across the book.
    pub fn max_liability(&self) -> Option<ExposureEntry> {
        self.entries().into_iter().max_by_key(|e| e.liability)
    }

    /// Sum of the per-outcome maxima. A combination counts once per leg, so this
    /// overstates the book's worst case and is not the operator's aggregate liability.
    pub fn total_liability(&self) -> Cents {
        self.entries.values().map(|s| s.liability).sum()
    }

    pub fn bet_count(&self) -> usize {
        self.by_bet.len()
    }

    /// Builds a fresh book from pending bets. Terminal records are skipped.
    pub fn rebuild<'a, I>(pending: I) -> Result<Self, PayoutError>
    where
        I: IntoIterator<Item = &'a BetRecord>,
    {
        let mut book = Self::new();
        for record in pending.into_iter().filter(|r| r.is_pending()) {
            book.add_bet(record)?;
        }
        Ok(book)
    }

    /// Compares this book against a rebuild and lists every outcome that differs.
    pub fn diff(&self, rebuilt: &ExposureBook) -> Vec<ExposureDrift> {
        let mut keys: Vec<&ExposureKey> = self.entries.keys().chain(rebuilt.entries.keys()).collect();
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .filter_map(|key| {
                let incremental = self.liability(key);
                let recomputed = rebuilt.liability(key);
                (incremental != recomputed).then(|| ExposureDrift {
                    key: key.clone(),
                    incremental,
                    recomputed,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureDrift {
    pub key: ExposureKey,
    pub incremental: Cents,
    pub recomputed: Cents,
}

impl fmt::Display for ExposureDrift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: incremental {} vs recomputed {}",
            self.key, self.incremental, self.recomputed
        )
    }
}
