//! Payout calculator for single, combination and system bets.
//!
//! Pure and deterministic. All arithmetic runs on `Decimal` and lands on whole
//! cents by truncation at the very end. System bets are always priced by full
//! enumeration of their k-of-n combinations, never by an assumed hit rate.

use crate::bet::{BetType, SelectionStatus};
use crate::types::{Cents, Odds, MAX_ODDS, MIN_ODDS, ODDS_SCALE};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Upper bound on enumerated combinations for one system bet.
pub const MAX_COMBINATIONS: u64 = 250_000;

/// What happens to a combination or system bet when one of its legs is voided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoidLegPolicy {
    /// Void legs count at odds 1.00; the rest of the bet stands.
    #[default]
    ExcludeVoidLegs,
    /// Any void leg voids the whole bet and the stake is refunded.
    VoidWholeBet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutQuote {
    /// Product of all leg odds rounded to 4 fractional digits.
    pub total_odds: Decimal,
    /// Gross return if every leg wins.
    pub potential_winnings: Cents,
    /// Number of stake units. 1 for singles and combinations, C(n, k) for systems.
    pub combinations: u64,
}

/// Outcome of applying leg results to a bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// At least one leg has no result yet.
    Pending,
    Won(Cents),
    Lost,
    /// Refund the stake.
    Void,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayoutError {
    #[error("{bet_type} bet needs {expected} selections, got {actual}")]
    SelectionCount {
        bet_type: &'static str,
        expected: String,
        actual: usize,
    },

    #[error("system fold {fold} is invalid for {selections} selections")]
    InvalidFold { fold: u8, selections: usize },

    #[error("odds {odds} outside [{min}, {max}]")]
    OddsOutOfRange { odds: Odds, min: Decimal, max: Decimal },

    #[error("stake {0} must be positive")]
    NonPositiveStake(Cents),

    #[error("{0} combinations exceed the enumeration limit")]
    TooManyCombinations(u64),

    #[error("payout arithmetic overflow")]
    Overflow,
}

/// C(n, k). Saturates at `u64::MAX` instead of overflowing.
pub fn binomial(n: usize, k: usize) -> u64 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut acc: u128 = 1;
    for i in 0..k {
        acc = acc * (n - i) as u128 / (i + 1) as u128;
        if acc > u64::MAX as u128 {
            return u64::MAX;
        }
    }
    acc as u64
}

/// Every k-sized index combination of `0..n`, in lexicographic order.
pub fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    if k == 0 || k > n {
        return out;
    }
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        out.push(idx.clone());
        // rightmost index that can still move
        let mut i = k;
        while i > 0 {
            i -= 1;
            if idx[i] < n - k + i {
                break;
            }
            if i == 0 {
                return out;
            }
        }
        if idx[i] >= n - k + i {
            return out;
        }
        idx[i] += 1;
        for j in i + 1..k {
            idx[j] = idx[j - 1] + 1;
        }
    }
}

fn product<I: IntoIterator<Item = Decimal>>(values: I) -> Result<Decimal, PayoutError> {
    values
        .into_iter()
        .try_fold(Decimal::ONE, |acc, v| acc.checked_mul(v).ok_or(PayoutError::Overflow))
}

/// Exact product of leg odds.
pub fn total_odds(odds: &[Odds]) -> Result<Decimal, PayoutError> {
    product(odds.iter().map(|o| o.value()))
}

pub fn round_total_odds(exact: Decimal) -> Decimal {
    let mut rounded = exact.round_dp_with_strategy(ODDS_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(ODDS_SCALE);
    rounded
}

fn to_cents(value: Decimal) -> Result<Cents, PayoutError> {
    Cents::from_decimal_floor(value).ok_or(PayoutError::Overflow)
}

fn times_stake(stake: Cents, factor: Decimal) -> Result<Decimal, PayoutError> {
    stake.as_decimal().checked_mul(factor).ok_or(PayoutError::Overflow)
}

/// Checks selection count, fold and the absolute odds range for a bet shape.
pub fn validate_shape(bet_type: BetType, odds: &[Odds]) -> Result<(), PayoutError> {
    let n = odds.len();
    match bet_type {
        BetType::Single if n != 1 => {
            return Err(PayoutError::SelectionCount {
                bet_type: "single",
                expected: "exactly 1".into(),
                actual: n,
            })
        }
        BetType::Combination if n < 2 => {
            return Err(PayoutError::SelectionCount {
                bet_type: "combination",
                expected: "at least 2".into(),
                actual: n,
            })
        }
        BetType::System { fold } => {
            if n < 3 {
                return Err(PayoutError::SelectionCount {
                    bet_type: "system",
                    expected: "at least 3".into(),
                    actual: n,
                });
            }
            let k = fold as usize;
            if k < 2 || k >= n {
                return Err(PayoutError::InvalidFold { fold, selections: n });
            }
            let count = binomial(n, k);
            if count > MAX_COMBINATIONS {
                return Err(PayoutError::TooManyCombinations(count));
            }
        }
        _ => {}
    }
    if let Some(bad) = odds.iter().find(|o| !o.in_range(MIN_ODDS, MAX_ODDS)) {
        return Err(PayoutError::OddsOutOfRange {
            odds: *bad,
            min: MIN_ODDS,
            max: MAX_ODDS,
        });
    }
    Ok(())
}

/// Prices a bet at placement time: total odds and the gross return if every leg wins.
pub fn quote(bet_type: BetType, stake: Cents, odds: &[Odds]) -> Result<PayoutQuote, PayoutError> {
    if !stake.is_positive() {
        return Err(PayoutError::NonPositiveStake(stake));
    }
    validate_shape(bet_type, odds)?;

    let exact = total_odds(odds)?;
    let (potential_winnings, combos) = match bet_type {
        BetType::Single | BetType::Combination => (to_cents(times_stake(stake, exact)?)?, 1),
        BetType::System { fold } => {
            let all_won: Vec<Option<Decimal>> = odds.iter().map(|o| Some(o.value())).collect();
            let (sum, count) = system_return_factor(&all_won, fold as usize)?;
            (system_payout(stake, sum, count)?, count)
        }
    };

    Ok(PayoutQuote {
        total_odds: round_total_odds(exact),
        potential_winnings,
        combinations: combos,
    })
}

// Sums Π odds over every combination whose legs all count (None = lost leg).
fn system_return_factor(legs: &[Option<Decimal>], k: usize) -> Result<(Decimal, u64), PayoutError> {
    let combos = combinations(legs.len(), k);
    let count = combos.len() as u64;
    let mut sum = Decimal::ZERO;
    for combo in combos {
        let factors: Option<Vec<Decimal>> = combo.iter().map(|&i| legs[i]).collect();
        if let Some(factors) = factors {
            let p = product(factors)?;
            sum = sum.checked_add(p).ok_or(PayoutError::Overflow)?;
        }
    }
    Ok((sum, count))
}

fn system_payout(stake: Cents, factor_sum: Decimal, count: u64) -> Result<Cents, PayoutError> {
    if count == 0 {
        return Ok(Cents::zero());
    }
    let gross = times_stake(stake, factor_sum)?;
    let per_unit = gross
        .checked_div(Decimal::from(count))
        .ok_or(PayoutError::Overflow)?;
    to_cents(per_unit)
}

/// Applies leg results to a bet. Nothing resolves while any leg is still pending.
pub fn resolve(
    bet_type: BetType,
    stake: Cents,
    legs: &[(Odds, SelectionStatus)],
    policy: VoidLegPolicy,
) -> Result<Resolution, PayoutError> {
    if legs.iter().any(|(_, s)| !s.is_terminal()) {
        return Ok(Resolution::Pending);
    }
    if legs.iter().all(|(_, s)| *s == SelectionStatus::Void) {
        return Ok(Resolution::Void);
    }
    let any_void = legs.iter().any(|(_, s)| *s == SelectionStatus::Void);

    match bet_type {
        BetType::Single => match legs.first().map(|(o, s)| (*o, *s)) {
            Some((odds, SelectionStatus::Won)) => {
                Ok(Resolution::Won(to_cents(times_stake(stake, odds.value())?)?))
            }
            Some((_, SelectionStatus::Lost)) => Ok(Resolution::Lost),
            _ => Ok(Resolution::Void),
        },
        BetType::Combination => {
            if legs.iter().any(|(_, s)| *s == SelectionStatus::Lost) {
                return Ok(Resolution::Lost);
            }
            if any_void && policy == VoidLegPolicy::VoidWholeBet {
                return Ok(Resolution::Void);
            }
            let factor = product(
                legs.iter()
                    .filter(|(_, s)| *s == SelectionStatus::Won)
                    .map(|(o, _)| o.value()),
            )?;
            Ok(Resolution::Won(to_cents(times_stake(stake, factor)?)?))
        }
        BetType::System { fold } => {
            if any_void && policy == VoidLegPolicy::VoidWholeBet {
                return Ok(Resolution::Void);
            }
            let counted: Vec<Option<Decimal>> = legs
                .iter()
                .map(|(o, s)| match s {
                    SelectionStatus::Won => Some(o.value()),
                    SelectionStatus::Void => Some(Decimal::ONE),
                    _ => None,
                })
                .collect();
            let (sum, count) = system_return_factor(&counted, fold as usize)?;
            let winnings = system_payout(stake, sum, count)?;
            if winnings.is_positive() {
                Ok(Resolution::Won(winnings))
            } else {
                Ok(Resolution::Lost)
            }
        }
    }
}

/// Contingent net liability each leg's outcome carries while the bet is pending,
/// in whole cents and in leg order.
pub fn leg_liabilities(bet_type: BetType, stake: Cents, odds: &[Odds]) -> Result<Vec<Cents>, PayoutError> {
    match bet_type {
        BetType::Single | BetType::Combination => {
            let net = total_odds(odds)? - Decimal::ONE;
            let liability = to_cents(times_stake(stake, net)?)?;
            Ok(vec![liability; odds.len()])
        }
        BetType::System { fold } => {
            let n = odds.len();
            let combos = combinations(n, fold as usize);
            let count = combos.len() as u64;
            let mut per_leg = vec![Decimal::ZERO; n];
            for combo in &combos {
                let net = product(combo.iter().map(|&i| odds[i].value()))? - Decimal::ONE;
                for &i in combo {
                    per_leg[i] = per_leg[i].checked_add(net).ok_or(PayoutError::Overflow)?;
                }
            }
            per_leg
                .into_iter()
                .map(|factor| system_payout(stake, factor, count))
                .collect()
        }
    }
}
