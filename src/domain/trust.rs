//! Buyer trust profiles

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BuyerId, TrustTier};

/// Baseline score for a newly onboarded buyer
pub const BASELINE_SCORE: u8 = 50;

/// Compliance counters over the scoring window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceCounters {
    /// Access decisions and releases involving the buyer
    pub interactions: u32,
    pub violations: u32,
    /// Revocations attributed to the buyer's conduct
    pub buyer_attributed_declines: u32,
    pub dsr_on_time: u32,
    pub dsr_missed: u32,
    /// Mean fulfillment latency over all DSR outcomes, whole hours
    pub mean_dsr_latency_hours: u32,
}

/// Immutable trust snapshot for one buyer.
///
/// `score` and `tier` change only by recomputation. `as_of_sequence` and
/// `recomputed_at` identify the newest audit entry the snapshot considered,
/// so recomputing over unchanged history yields an identical profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustProfile {
    pub buyer_id: BuyerId,
    pub score: u8,
    pub tier: TrustTier,
    pub counters: ComplianceCounters,
    pub as_of_sequence: u64,
    pub recomputed_at: DateTime<Utc>,
    /// Number of audit entries the score was computed over
    pub window_len: u32,
}

impl TrustProfile {
    /// Profile published at onboarding, before any history exists
    pub fn initial(
        buyer_id: BuyerId,
        tier: TrustTier,
        as_of_sequence: u64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            buyer_id,
            score: BASELINE_SCORE,
            tier,
            counters: ComplianceCounters::default(),
            as_of_sequence,
            recomputed_at: at,
            window_len: 0,
        }
    }
}
