//! Bet placement: request validation, market checks, atomic stake reservation
//! and the exposure increment that follows it.

use super::core::Engine;
use super::results::{PlacementError, PlacementResult, ValidationError};
use crate::bet::{BetDraft, BetType, PlacementRequest, SelectionSpec};
use crate::config::PlacementLimits;
use crate::events::{BetPlacedEvent, EventPayload, StakeReservedEvent};
use crate::exposure::ExposureKey;
use crate::payout::{leg_liabilities, quote, PayoutQuote};
use crate::types::{Cents, FixtureId, MarketKey};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, error, info, warn};

/// Checks a request against the limits and prices every bet it would create.
/// Pure: nothing outside the request and the limits is consulted.
pub fn validate_request(
    request: &PlacementRequest,
    limits: &PlacementLimits,
) -> Result<Vec<(BetDraft, PayoutQuote)>, ValidationError> {
    let stake = request.stake();
    if stake < limits.min_stake || stake > limits.max_stake {
        return Err(ValidationError::StakeOutOfRange {
            stake,
            min: limits.min_stake,
            max: limits.max_stake,
        });
    }

    let bet_type = request.bet_type();
    let selections = request.selections();
    let n = selections.len();
    let (min, max) = match bet_type {
        BetType::Single => (1, limits.max_selections),
        BetType::Combination => (2, limits.max_selections),
        BetType::System { .. } => (3, limits.max_system_selections),
    };
    if n < min || n > max {
        return Err(ValidationError::SelectionCount {
            bet_type: bet_type.as_str(),
            min,
            max,
            actual: n,
        });
    }
    if let BetType::System { fold } = bet_type {
        if fold < 2 || fold as usize >= n {
            return Err(ValidationError::InvalidFold { fold, selections: n });
        }
    }

    for selection in selections {
        if !selection.odds.in_range(limits.min_odds, limits.max_odds) {
            return Err(ValidationError::OddsOutOfRange {
                odds: selection.odds,
                min: limits.min_odds,
                max: limits.max_odds,
            });
        }
    }

    let mut seen = HashSet::new();
    for s in selections {
        if !seen.insert((&s.fixture_id, &s.market_key, &s.outcome_key)) {
            return Err(ValidationError::DuplicateSelection {
                fixture_id: s.fixture_id.clone(),
                market_key: s.market_key.clone(),
                outcome_key: s.outcome_key.clone(),
            });
        }
    }

    // two outcomes of one market in the same accumulator are never independent
    if bet_type != BetType::Single && limits.reject_correlated_legs {
        let mut markets = HashSet::new();
        for s in selections {
            if !markets.insert((&s.fixture_id, &s.market_key)) {
                return Err(ValidationError::CorrelatedLegs {
                    fixture_id: s.fixture_id.clone(),
                    market_key: s.market_key.clone(),
                });
            }
        }
    }

    let groups: Vec<Vec<SelectionSpec>> = match bet_type {
        BetType::Single => selections.iter().map(|s| vec![s.clone()]).collect(),
        _ => vec![selections.to_vec()],
    };

    let mut priced = Vec::with_capacity(groups.len());
    for legs in groups {
        let odds: Vec<_> = legs.iter().map(|s| s.odds).collect();
        let q = quote(bet_type, stake, &odds)?;
        // exposure is computed after the stake is taken, so it must not be able to fail then
        leg_liabilities(bet_type, stake, &odds)?;
        priced.push((
            BetDraft {
                bet_type,
                stake,
                total_odds: q.total_odds,
                potential_winnings: q.potential_winnings,
                selections: legs,
            },
            q,
        ));
    }
    Ok(priced)
}

impl Engine {
    /// Validates, checks every market is open, reserves the stake for all bets at once,
    /// then adds the new bets to the exposure book.
    pub fn place_bet(&self, request: PlacementRequest) -> Result<PlacementResult, PlacementError> {
        let account_id = request.account_id();

        let priced = validate_request(&request, &self.config.placement).map_err(|e| {
            debug!(account_id = %account_id, error = %e, "placement rejected");
            PlacementError::from(e)
        })?;
        self.check_markets_open(request.selections())?;

        let (drafts, quotes): (Vec<BetDraft>, Vec<PayoutQuote>) = priced.into_iter().unzip();
        let placed_at = self.now();
        let reservation = self
            .with_retry("reserve_stake", || {
                self.ledger
                    .reserve_stake_and_create_bets(account_id, &drafts, placed_at)
            })
            .map_err(|e| {
                debug!(account_id = %account_id, error = %e, "stake reservation failed");
                PlacementError::from(e)
            })?;

        let mut touched: BTreeSet<ExposureKey> = BTreeSet::new();
        {
            // settlement finalizes before it takes this lock, so a bet that is
            // terminal by now has already had its remove_bet and must not be added
            let mut book = self.exposure.write();
            for record in &reservation.bets {
                match self.ledger.bet(record.id()) {
                    Ok(Some(current)) if !current.is_pending() => {
                        debug!(bet_id = %record.id(), status = %current.bet.status, "bet settled before exposure update");
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(bet_id = %record.id(), error = %e, "bet reread failed, adding exposure as placed"),
                }
                match book.add_bet(record) {
                    Ok(keys) => touched.extend(keys),
                    // validated above, so this means the book and the ledger disagree
                    Err(e) => error!(bet_id = %record.id(), error = %e, "exposure update failed"),
                }
            }
        }

        let total_stake: Cents = reservation.bets.iter().map(|r| r.bet.stake).sum();
        self.emit(EventPayload::StakeReserved(StakeReservedEvent {
            account_id,
            bet_ids: reservation.bets.iter().map(|r| r.id()).collect(),
            total_stake,
            new_balance: reservation.new_balance,
        }));
        for record in &reservation.bets {
            self.emit(EventPayload::BetPlaced(BetPlacedEvent {
                bet_id: record.id(),
                account_id,
                bet_type: record.bet.bet_type,
                stake: record.bet.stake,
                potential_winnings: record.bet.potential_winnings,
                selections: record.selections.len(),
            }));
        }
        self.publish_exposure(&touched.into_iter().collect::<Vec<_>>());

        info!(
            account_id = %account_id,
            bet_type = %request.bet_type(),
            bets = reservation.bets.len(),
            total_stake = %total_stake,
            new_balance = %reservation.new_balance,
            "placement accepted"
        );

        Ok(PlacementResult {
            bets: reservation.bets,
            transactions: reservation.transactions,
            new_balance: reservation.new_balance,
            quotes,
        })
    }

    // a market service failure counts as closed
    fn check_markets_open(&self, selections: &[SelectionSpec]) -> Result<(), PlacementError> {
        let markets: BTreeSet<(&FixtureId, &MarketKey)> =
            selections.iter().map(|s| (&s.fixture_id, &s.market_key)).collect();

        for (fixture_id, market_key) in markets {
            match self.markets.is_market_open(fixture_id, market_key) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(fixture_id = %fixture_id, market_key = %market_key, "market closed");
                    return Err(PlacementError::MarketClosed {
                        fixture_id: fixture_id.clone(),
                        market_key: market_key.clone(),
                    });
                }
                Err(e) => {
                    warn!(
                        fixture_id = %fixture_id,
                        market_key = %market_key,
                        error = %e,
                        "market service failed, treating market as closed"
                    );
                    return Err(PlacementError::MarketClosed {
                        fixture_id: fixture_id.clone(),
                        market_key: market_key.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
