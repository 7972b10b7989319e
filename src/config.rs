// 13.0 config.rs: all settings in one place. stake limits, settlement policy, reconciliation timing.
// 13.1 every section has serde defaults so a TOML file only lists what it overrides.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::events::DEFAULT_MAX_EVENTS;
use crate::payout::VoidLegPolicy;
use crate::retry::RetryPolicy;
use crate::types::{Cents, MAX_ODDS, MIN_ODDS};

// What a placement request may look like
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementLimits {
    // Smallest stake per bet
    pub min_stake: Cents,
    // Largest stake per bet
    pub max_stake: Cents,
    // Odds bounds, must sit inside the absolute [1.01, 1000] range
    pub min_odds: Decimal,
    pub max_odds: Decimal,
    // Upper bound on legs for singles and combinations
    pub max_selections: usize,
    // Systems enumerate C(n, k) combinations, so they get a tighter bound
    pub max_system_selections: usize,
    // Refuse two legs on the same fixture and market in one multi-leg bet
    pub reject_correlated_legs: bool,
}

impl Default for PlacementLimits {
    fn default() -> Self {
        Self {
            min_stake: Cents::new(100),        // 1.00
            max_stake: Cents::new(1_000_000),  // 10,000.00
            min_odds: MIN_ODDS,
            max_odds: MAX_ODDS,
            max_selections: 20,
            max_system_selections: 12,
            reject_correlated_legs: true,
        }
    }
}

/** 13.2: settlement policy. the void leg rule is a business decision, not a constant. */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementParams {
    pub void_leg_policy: VoidLegPolicy,
}

impl Default for SettlementParams {
    fn default() -> Self {
        Self {
            void_leg_policy: VoidLegPolicy::ExcludeVoidLegs,
        }
    }
}

// Reconciliation timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationParams {
    // How often the worker sweeps pending fixtures
    pub interval_ms: u64,
    // How long a fixture may wait for a final result before it is reported missing
    pub missing_result_after_ms: i64,
    // How long an applied result keeps being re-checked for mismatches
    pub mismatch_watch_ms: i64,
}

impl Default for ReconciliationParams {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,                   // 30s
            missing_result_after_ms: 7_200_000,    // 2h
            mismatch_watch_ms: 86_400_000,         // 24h
        }
    }
}

impl ReconciliationParams {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// Ledger store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerParams {
    // Bounded wait for an account lock before reporting a conflict
    pub lock_timeout_ms: u64,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self { lock_timeout_ms: 250 }
    }
}

impl LedgerParams {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

// The complete configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WagerConfig {
    // Events kept in memory before the oldest are dropped
    pub max_events: usize,
    pub placement: PlacementLimits,
    pub settlement: SettlementParams,
    pub reconciliation: ReconciliationParams,
    pub ledger: LedgerParams,
    pub retry: RetryPolicy,
}

impl Default for WagerConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            placement: PlacementLimits::default(),
            settlement: SettlementParams::default(),
            reconciliation: ReconciliationParams::default(),
            ledger: LedgerParams::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WagerConfig {
    // Local development: short timers so anomalies show up quickly
    pub fn development() -> Self {
        let mut config = Self::default();
        config.reconciliation.interval_ms = 1_000;
        config.reconciliation.missing_result_after_ms = 60_000; // 1 minute
        config.reconciliation.mismatch_watch_ms = 3_600_000;
        config.retry = RetryPolicy::new(2, 5, 20, 0.0);
        config
    }

    pub fn staging() -> Self {
        let mut config = Self::default();
        config.reconciliation.interval_ms = 10_000;
        config.reconciliation.missing_result_after_ms = 1_800_000; // 30 minutes
        config
    }

    // Production: defaults with a lower stake ceiling and a longer lock wait
    pub fn production() -> Self {
        let mut config = Self::default();
        config.placement.max_stake = Cents::new(500_000);
        config.ledger.lock_timeout_ms = 500;
        config.retry = RetryPolicy::new(5, 10, 400, 0.2);
        config
    }

    /// Parses a TOML document and validates it. Missing sections take defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: WagerConfig = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.placement;
        if !p.min_stake.is_positive() || p.min_stake > p.max_stake {
            return Err(ConfigError::InvalidPlacement {
                reason: format!("stake bounds [{}, {}] are inconsistent", p.min_stake, p.max_stake),
            });
        }
        if p.min_odds < MIN_ODDS || p.max_odds > MAX_ODDS || p.min_odds >= p.max_odds {
            return Err(ConfigError::InvalidPlacement {
                reason: format!("odds bounds [{}, {}] must lie inside [{}, {}]", p.min_odds, p.max_odds, MIN_ODDS, MAX_ODDS),
            });
        }
        // a system needs at least 3 legs
        if p.max_selections < 2 || p.max_system_selections < 3 {
            return Err(ConfigError::InvalidPlacement {
                reason: "selection bounds too small for combination or system bets".to_string(),
            });
        }

        if self.reconciliation.interval_ms == 0 {
            return Err(ConfigError::InvalidReconciliation {
                reason: "interval must be positive".to_string(),
            });
        }
        if self.reconciliation.missing_result_after_ms <= 0 || self.reconciliation.mismatch_watch_ms < 0 {
            return Err(ConfigError::InvalidReconciliation {
                reason: "thresholds must be positive".to_string(),
            });
        }

        if self.ledger.lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidLedger {
                reason: "lock timeout must be positive".to_string(),
            });
        }

        if self.retry.max_attempts == 0 || self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidRetry {
                reason: "need at least one attempt and base delay <= max delay".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_pct) {
            return Err(ConfigError::InvalidRetry {
                reason: "jitter must be within [0, 1]".to_string(),
            });
        }

        if self.max_events == 0 {
            return Err(ConfigError::InvalidLedger {
                reason: "event retention must be positive".to_string(),
            });
        }

        Ok(())
    }
}

// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid placement limits: {reason}")]
    InvalidPlacement { reason: String },

    #[error("invalid reconciliation settings: {reason}")]
    InvalidReconciliation { reason: String },

    #[error("invalid ledger settings: {reason}")]
    InvalidLedger { reason: String },

    #[error("invalid retry policy: {reason}")]
    InvalidRetry { reason: String },

    #[error("config parse error: {0}")]
    Parse(String),
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn config(&self) -> WagerConfig {
        match self {
            Environment::Development => WagerConfig::development(),
            Environment::Staging => WagerConfig::staging(),
            Environment::Production => WagerConfig::production(),
        }
    }
}
