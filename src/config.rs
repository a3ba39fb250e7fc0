//! Runtime configuration
//!
//! Everything loads from environment variables with documented defaults:
//!
//! - `CONSENT_DATABASE_URL` - SQLite URL for persistent storage (default: in-memory)
//! - `CONSENT_TOKEN_TTL_SECS` - Package access token lifetime (default: 86400)
//! - `CONSENT_MIN_TIER` - Minimum acceptable buyer tier (default: provisional)
//! - `CONSENT_TIER_FLOORS` - Tier floor overrides, e.g. `standard=full,trusted=partial`
//! - `TRUST_WINDOW_SIZE` - Audit entries considered per recompute (default: 500)
//! - `TRUST_HISTORY_DEPTH` - Profile versions retained per buyer (default: 32)
//! - `TRUST_RECOMPUTE_INTERVAL_SECS` - Batch recompute period (default: 300)
//! - `TRUST_EAGER_RECOMPUTE` - Recompute on qualifying audit events (default: true)

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::{AnonymizationLevel, TrustTier, BASELINE_SCORE};
use crate::infra::{LedgerError, Result};

/// Tier floors and the minimum acceptable tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    /// Minimum anonymization level each tier may receive
    pub floors: BTreeMap<TrustTier, AnonymizationLevel>,
    /// Buyers below this tier are denied regardless of consent
    pub minimum_tier: TrustTier,
}

impl Default for TierPolicy {
    fn default() -> Self {
        let floors = BTreeMap::from([
            (TrustTier::Untrusted, AnonymizationLevel::Full),
            (TrustTier::Provisional, AnonymizationLevel::Full),
            (TrustTier::Standard, AnonymizationLevel::Partial),
            (TrustTier::Trusted, AnonymizationLevel::Minimal),
            (TrustTier::Verified, AnonymizationLevel::None),
        ]);
        Self {
            floors,
            minimum_tier: TrustTier::Provisional,
        }
    }
}

impl TierPolicy {
    /// Floor for a tier. Unmapped tiers get the strictest level.
    pub fn floor_for(&self, tier: TrustTier) -> AnonymizationLevel {
        self.floors
            .get(&tier)
            .copied()
            .unwrap_or(AnonymizationLevel::Full)
    }

    pub fn admits(&self, tier: TrustTier) -> bool {
        tier >= self.minimum_tier
    }

    pub fn with_floor(mut self, tier: TrustTier, level: AnonymizationLevel) -> Self {
        self.floors.insert(tier, level);
        self
    }

    pub fn with_minimum_tier(mut self, tier: TrustTier) -> Self {
        self.minimum_tier = tier;
        self
    }

    /// A more trusted tier must never get a stricter floor than a less
    /// trusted one.
    pub fn validate(&self) -> Result<()> {
        for pair in TrustTier::ALL.windows(2) {
            let (lower, higher) = (pair[0], pair[1]);
            if self.floor_for(higher) > self.floor_for(lower) {
                return Err(LedgerError::Configuration(format!(
                    "floor for {higher} ({}) is stricter than for {lower} ({})",
                    self.floor_for(higher),
                    self.floor_for(lower)
                )));
            }
        }
        Ok(())
    }

    /// Apply overrides of the form `tier=level,tier=level`.
    pub fn apply_overrides(mut self, spec: &str) -> Result<Self> {
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (tier, level) = pair.split_once('=').ok_or_else(|| {
                LedgerError::Configuration(format!("expected tier=level, got {pair}"))
            })?;
            self.floors
                .insert(TrustTier::from_str(tier)?, AnonymizationLevel::from_str(level)?);
        }
        Ok(self)
    }
}

/// Score thresholds for each tier above `Untrusted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThresholds {
    pub provisional: u8,
    pub standard: u8,
    pub trusted: u8,
    pub verified: u8,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            provisional: 20,
            standard: 40,
            trusted: 70,
            verified: 90,
        }
    }
}

impl TierThresholds {
    pub fn tier_for(&self, score: u8) -> TrustTier {
        if score >= self.verified {
            TrustTier::Verified
        } else if score >= self.trusted {
            TrustTier::Trusted
        } else if score >= self.standard {
            TrustTier::Standard
        } else if score >= self.provisional {
            TrustTier::Provisional
        } else {
            TrustTier::Untrusted
        }
    }
}

/// Penalties and credits applied by the scoring pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringWeights {
    pub violation_penalty: i32,
    pub decline_penalty: i32,
    pub dsr_missed_penalty: i32,
    pub dsr_on_time_credit: i32,
    pub clean_streak_credit: i32,
    /// Clean interactions needed for one streak credit
    pub clean_streak_len: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            violation_penalty: 25,
            decline_penalty: 10,
            dsr_missed_penalty: 20,
            dsr_on_time_credit: 4,
            clean_streak_credit: 3,
            clean_streak_len: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoringConfig {
    /// Most recent buyer entries considered per recompute
    pub window_size: usize,
    pub baseline: u8,
    pub weights: ScoringWeights,
    pub thresholds: TierThresholds,
    /// Profile versions kept per buyer in the snapshot arena
    pub history_depth: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            window_size: 500,
            baseline: BASELINE_SCORE,
            weights: ScoringWeights::default(),
            thresholds: TierThresholds::default(),
            history_depth: 32,
        }
    }
}

/// Configuration for the background trust recompute worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustWorkerConfig {
    /// How often every buyer is recomputed
    pub recompute_interval: Duration,
    /// Recompute a buyer as soon as a qualifying entry lands
    pub eager: bool,
}

impl Default for TrustWorkerConfig {
    fn default() -> Self {
        Self {
            recompute_interval: Duration::from_secs(300),
            eager: true,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// SQLite URL; `None` keeps everything in memory
    pub database_url: Option<String>,
    pub token_ttl: chrono::Duration,
    pub tier_policy: TierPolicy,
    pub scoring: ScoringConfig,
    pub worker: TrustWorkerConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            token_ttl: chrono::Duration::hours(24),
            tier_policy: TierPolicy::default(),
            scoring: ScoringConfig::default(),
            worker: TrustWorkerConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let database_url = std::env::var("CONSENT_DATABASE_URL").ok();

        let token_ttl = std::env::var("CONSENT_TOKEN_TTL_SECS")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(chrono::Duration::seconds)
            .unwrap_or(defaults.token_ttl);

        let mut tier_policy = defaults.tier_policy;
        if let Ok(tier) = std::env::var("CONSENT_MIN_TIER") {
            tier_policy.minimum_tier = TrustTier::from_str(&tier)?;
        }
        if let Ok(spec) = std::env::var("CONSENT_TIER_FLOORS") {
            tier_policy = tier_policy.apply_overrides(&spec)?;
        }

        let window_size = std::env::var("TRUST_WINDOW_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.scoring.window_size);

        let history_depth = std::env::var("TRUST_HISTORY_DEPTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.scoring.history_depth);

        let recompute_interval = std::env::var("TRUST_RECOMPUTE_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.worker.recompute_interval);

        let eager = std::env::var("TRUST_EAGER_RECOMPUTE")
            .ok()
            .map(|s| s == "true" || s == "1")
            .unwrap_or(defaults.worker.eager);

        let config = Self {
            database_url,
            token_ttl,
            tier_policy,
            scoring: ScoringConfig {
                window_size,
                history_depth,
                ..defaults.scoring
            },
            worker: TrustWorkerConfig {
                recompute_interval,
                eager,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token_ttl <= chrono::Duration::zero() {
            return Err(LedgerError::Configuration(
                "token ttl must be positive".into(),
            ));
        }
        if self.scoring.window_size == 0 {
            return Err(LedgerError::Configuration(
                "trust window size must be positive".into(),
            ));
        }
        if self.scoring.weights.clean_streak_len == 0 {
            return Err(LedgerError::Configuration(
                "clean streak length must be positive".into(),
            ));
        }
        self.tier_policy.validate()
    }

    pub fn with_token_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn with_tier_policy(mut self, policy: TierPolicy) -> Self {
        self.tier_policy = policy;
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_worker(mut self, worker: TrustWorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}
