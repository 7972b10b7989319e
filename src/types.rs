// 1.0: all the primitives live here. nothing in the ledger works without these types.
// IDs, money, odds, timestamps. each is a newtype so the compiler catches type mixups.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BetId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SelectionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IssueId(pub u64);

macro_rules! impl_display_id {
    ($($name:ident),*) => {
        $(impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

impl_display_id!(AccountId, BetId, SelectionId, TransactionId, IssueId);

// 1.1: keys that come from the outside world (fixtures, markets, operators) stay strings.
macro_rules! string_key {
    ($($name:ident),*) => {
        $(
            #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(String);

            impl $name {
                pub fn new(value: impl Into<String>) -> Self {
                    Self(value.into())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    Self(value.to_string())
                }
            }
        )*
    };
}

string_key!(FixtureId, MarketKey, OutcomeKey, ActorId);

// 1.2: integer cents. every balance, stake and payout is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Cents) -> Option<Cents> {
        self.0.checked_add(other.0).map(Cents)
    }

    pub fn checked_sub(&self, other: Cents) -> Option<Cents> {
        self.0.checked_sub(other.0).map(Cents)
    }

    pub fn checked_mul(&self, factor: i64) -> Option<Cents> {
        self.0.checked_mul(factor).map(Cents)
    }

    pub fn negate(&self) -> Self {
        Self(-self.0)
    }

    pub fn as_decimal(&self) -> Decimal {
        Decimal::from(self.0)
    }

    // truncates toward zero. payouts never round up in the customer's favour.
    pub fn from_decimal_floor(value: Decimal) -> Option<Cents> {
        use rust_decimal::prelude::ToPrimitive;
        value.trunc().to_i64().map(Cents)
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Sum for Cents {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Cents::ZERO, |acc, c| Cents(acc.0 + c.0))
    }
}

impl<'a> Sum<&'a Cents> for Cents {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Cents::ZERO, |acc, c| Cents(acc.0 + c.0))
    }
}

// 1.3: decimal odds. fixed point, 4 fractional digits, parsed from strings only.
pub const ODDS_SCALE: u32 = 4;
pub const MIN_ODDS: Decimal = dec!(1.01);
pub const MAX_ODDS: Decimal = dec!(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Odds(Decimal);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OddsError {
    #[error("odds '{0}' are not a decimal number")]
    Malformed(String),

    #[error("odds '{0}' carry more than 4 fractional digits")]
    TooPrecise(String),

    #[error("odds {0} must be greater than 1")]
    NotAboveOne(Decimal),
}

impl Odds {
    pub fn parse(raw: &str) -> Result<Self, OddsError> {
        let trimmed = raw.trim();
        let value = Decimal::from_str_exact(trimmed)
            .map_err(|_| OddsError::Malformed(raw.to_string()))?;
        if value.normalize().scale() > ODDS_SCALE {
            return Err(OddsError::TooPrecise(raw.to_string()));
        }
        Self::from_decimal(value)
    }

    pub fn from_decimal(value: Decimal) -> Result<Self, OddsError> {
        if value.normalize().scale() > ODDS_SCALE {
            return Err(OddsError::TooPrecise(value.to_string()));
        }
        if value <= Decimal::ONE {
            return Err(OddsError::NotAboveOne(value));
        }
        let mut scaled = value;
        scaled.rescale(ODDS_SCALE);
        Ok(Self(scaled))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn in_range(&self, min: Decimal, max: Decimal) -> bool {
        self.0 >= min && self.0 <= max
    }

    // net return per unit staked
    pub fn net(&self) -> Decimal {
        self.0 - Decimal::ONE
    }
}

impl fmt::Display for Odds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Odds {
    type Err = OddsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Odds {
    type Error = OddsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Odds> for String {
    fn from(odds: Odds) -> Self {
        odds.to_string()
    }
}

// 1.4: millisecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn elapsed_since(&self, earlier: Timestamp) -> i64 {
        self.0 - earlier.0
    }

    pub fn plus_millis(&self, ms: i64) -> Self {
        Self(self.0 + ms)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

// 1.5: time source. the engine never reads the wall clock directly so tests stay deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.as_millis()),
        }
    }

    pub fn set(&self, timestamp: Timestamp) {
        self.millis.store(timestamp.as_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odds_parse_normalizes_scale() {
        let odds = Odds::parse("2.5").unwrap();
        assert_eq!(odds.to_string(), "2.5000");
        assert_eq!(odds.value(), dec!(2.5));
        assert_eq!(odds.net(), dec!(1.5));
    }

    #[test]
    fn odds_parse_rejects_garbage() {
        assert!(matches!(Odds::parse("abc"), Err(OddsError::Malformed(_))));
        assert!(matches!(Odds::parse("1.23456"), Err(OddsError::TooPrecise(_))));
        assert!(matches!(Odds::parse("1.0"), Err(OddsError::NotAboveOne(_))));
        assert!(matches!(Odds::parse("0.5"), Err(OddsError::NotAboveOne(_))));
    }

    #[test]
    fn odds_trailing_zeros_are_not_precision() {
        // "2.500000" is still 2.5
        assert_eq!(Odds::parse("2.500000").unwrap().to_string(), "2.5000");
    }

    #[test]
    fn odds_serde_as_string() {
        let odds = Odds::parse("1.80").unwrap();
        let json = serde_json::to_string(&odds).unwrap();
        assert_eq!(json, "\"1.8000\"");
        let back: Odds = serde_json::from_str("\"1.8\"").unwrap();
        assert_eq!(back, odds);
        assert!(serde_json::from_str::<Odds>("\"0.9\"").is_err());
    }

    #[test]
    fn cents_display_and_floor() {
        assert_eq!(Cents::new(5000).to_string(), "50.00");
        assert_eq!(Cents::new(-105).to_string(), "-1.05");
        assert_eq!(Cents::from_decimal_floor(dec!(5399.999)), Some(Cents::new(5399)));
        assert_eq!(Cents::new(7).checked_mul(3), Some(Cents::new(21)));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        clock.advance(500);
        assert_eq!(clock.now(), Timestamp::from_millis(1_500));
        clock.set(Timestamp::from_millis(10));
        assert_eq!(clock.now().as_millis(), 10);
    }
}
