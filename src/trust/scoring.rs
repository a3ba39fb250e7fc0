//! Deterministic trust scoring over a buyer's audit window
//!
//! The score is a pure function of the window: the same entries and config
//! always produce the same profile, including `recomputed_at`, which is the
//! timestamp of the newest entry considered rather than wall-clock time.

use crate::config::ScoringConfig;
use crate::domain::{AuditEntry, AuditPayload, BuyerId, ComplianceCounters, TrustProfile};

/// Score a buyer over `window` (ascending, all attributable to `buyer_id`).
///
/// Returns `None` for an empty window; an onboarded buyer always has at
/// least its onboarding entry.
pub fn score_history(
    buyer_id: &BuyerId,
    window: &[AuditEntry],
    config: &ScoringConfig,
) -> Option<TrustProfile> {
    let last = window.last()?;
    let weights = &config.weights;

    let mut score = i32::from(config.baseline);
    let mut counters = ComplianceCounters::default();
    let mut streak: u32 = 0;
    let mut dsr_latency_total: u64 = 0;

    for entry in window {
        match &entry.payload {
            AuditPayload::PolicyViolation { .. } => {
                counters.violations += 1;
                score -= weights.violation_penalty;
                streak = 0;
            }
            AuditPayload::GrantRevoked { reason, .. } if reason.attributable_to_buyer() => {
                counters.buyer_attributed_declines += 1;
                score -= weights.decline_penalty;
                streak = 0;
            }
            AuditPayload::DsrFulfilled {
                on_time,
                latency_hours,
                ..
            } => {
                dsr_latency_total += u64::from(*latency_hours);
                if *on_time {
                    counters.dsr_on_time += 1;
                    score += weights.dsr_on_time_credit;
                } else {
                    counters.dsr_missed += 1;
                    score -= weights.dsr_missed_penalty;
                    streak = 0;
                }
            }
            // A release also carries an `access_granted` decision; only the
            // package counts as the interaction.
            AuditPayload::PackageIssued { .. } => {
                counters.interactions += 1;
                streak += 1;
                if weights.clean_streak_len > 0 && streak % weights.clean_streak_len == 0 {
                    score += weights.clean_streak_credit;
                }
            }
            // Denials are never held against the buyer; the rest is neutral.
            _ => {}
        }
    }

    let dsr_total = counters.dsr_on_time + counters.dsr_missed;
    if dsr_total > 0 {
        counters.mean_dsr_latency_hours =
            u32::try_from(dsr_latency_total / u64::from(dsr_total)).unwrap_or(u32::MAX);
    }

    let score = score.clamp(0, 100) as u8;
    Some(TrustProfile {
        buyer_id: buyer_id.clone(),
        score,
        tier: config.thresholds.tier_for(score),
        counters,
        as_of_sequence: last.sequence,
        recomputed_at: last.recorded_at,
        window_len: u32::try_from(window.len()).unwrap_or(u32::MAX),
    })
}

/// Whether an entry can move a buyer's score
pub fn affects_score(payload: &AuditPayload) -> bool {
    match payload {
        AuditPayload::GrantRevoked { reason, .. } => reason.attributable_to_buyer(),
        AuditPayload::PolicyViolation { .. }
        | AuditPayload::DsrFulfilled { .. }
        | AuditPayload::PackageIssued { .. } => true,
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{
        Actor, AnonymizationLevel, DataCategory, DecisionOutcome, DenialReason, GrantId, PackageId,
        RequestId, RevocationReason, TrustTier, UserId,
    };
    use chrono::{Duration, TimeZone, Utc};

    /// Build an unchained window for scoring; hashes are irrelevant here.
    pub(crate) fn window_of(buyer: &BuyerId, payloads: Vec<AuditPayload>) -> Vec<AuditEntry> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| AuditEntry {
                sequence: i as u64 + 1,
                prev_hash: [0u8; 32],
                entry_hash: [0u8; 32],
                actor: Actor::buyer(buyer),
                action: payload.action(),
                recorded_at: start + Duration::minutes(i as i64),
                payload,
            })
            .collect()
    }

    fn granted(buyer: &BuyerId) -> AuditPayload {
        AuditPayload::AccessGranted {
            request_id: RequestId::new(),
            grant_id: GrantId::new(),
            user_id: UserId::new("u1"),
            buyer_id: buyer.clone(),
            category: DataCategory::new("location"),
            purpose: "research".into(),
            outcome: DecisionOutcome::Allow,
            effective_level: AnonymizationLevel::Partial,
            trust_tier: TrustTier::Standard,
        }
    }

    fn issued(buyer: &BuyerId) -> AuditPayload {
        AuditPayload::PackageIssued {
            package_id: PackageId::new(),
            request_id: RequestId::new(),
            grant_id: GrantId::new(),
            user_id: UserId::new("u1"),
            buyer_id: buyer.clone(),
            applied_level: AnonymizationLevel::Partial,
            payload_digest: [7u8; 32],
            token_expires_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        }
    }

    fn onboarded(buyer: &BuyerId) -> AuditPayload {
        AuditPayload::BuyerOnboarded {
            buyer_id: buyer.clone(),
        }
    }

    #[test]
    fn test_empty_window_has_no_profile() {
        let buyer = BuyerId::new("acme");
        assert!(score_history(&buyer, &[], &ScoringConfig::default()).is_none());
    }

    #[test]
    fn test_onboarding_only_is_baseline() {
        let buyer = BuyerId::new("acme");
        let window = window_of(&buyer, vec![onboarded(&buyer)]);
        let profile = score_history(&buyer, &window, &ScoringConfig::default()).unwrap();
        assert_eq!(profile.score, 50);
        assert_eq!(profile.tier, TrustTier::Standard);
        assert_eq!(profile.as_of_sequence, 1);
        assert_eq!(profile.window_len, 1);
    }

    #[test]
    fn test_penalties_and_clamp() {
        let buyer = BuyerId::new("acme");
        let mut payloads = vec![onboarded(&buyer)];
        for i in 0..3 {
            payloads.push(AuditPayload::PolicyViolation {
                buyer_id: buyer.clone(),
                description: format!("violation {i}"),
            });
        }
        let window = window_of(&buyer, payloads);
        let profile = score_history(&buyer, &window, &ScoringConfig::default()).unwrap();
        assert_eq!(profile.score, 0);
        assert_eq!(profile.tier, TrustTier::Untrusted);
        assert_eq!(profile.counters.violations, 3);
    }

    #[test]
    fn test_only_buyer_conduct_revocations_count() {
        let buyer = BuyerId::new("acme");
        let revoked = |reason| AuditPayload::GrantRevoked {
            grant_id: GrantId::new(),
            user_id: UserId::new("u1"),
            buyer_id: buyer.clone(),
            category: DataCategory::new("location"),
            reason,
            revoked_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        let window = window_of(
            &buyer,
            vec![
                onboarded(&buyer),
                revoked(RevocationReason::UserRequest),
                revoked(RevocationReason::BuyerConduct("resold data".into())),
            ],
        );
        let profile = score_history(&buyer, &window, &ScoringConfig::default()).unwrap();
        assert_eq!(profile.counters.buyer_attributed_declines, 1);
        assert_eq!(profile.score, 40);
    }

    #[test]
    fn test_denials_are_neutral() {
        let buyer = BuyerId::new("acme");
        let denied = AuditPayload::AccessDenied {
            request_id: RequestId::new(),
            grant_id: None,
            user_id: UserId::new("u1"),
            buyer_id: buyer.clone(),
            category: DataCategory::new("location"),
            purpose: "ads".into(),
            reason: DenialReason::PurposeMismatch,
            trust_tier: TrustTier::Standard,
            detail: None,
        };
        let window = window_of(&buyer, vec![onboarded(&buyer), denied.clone(), denied]);
        let profile = score_history(&buyer, &window, &ScoringConfig::default()).unwrap();
        assert_eq!(profile.score, 50);
        assert_eq!(profile.counters.interactions, 0);
    }

    #[test]
    fn test_clean_streak_and_dsr_credits() {
        let buyer = BuyerId::new("acme");
        let mut payloads = vec![onboarded(&buyer)];
        payloads.extend((0..40).flat_map(|_| [granted(&buyer), issued(&buyer)]));
        payloads.push(AuditPayload::DsrFulfilled {
            buyer_id: buyer.clone(),
            request_ref: "dsr-1".into(),
            on_time: true,
            latency_hours: 10,
        });
        payloads.push(AuditPayload::DsrFulfilled {
            buyer_id: buyer.clone(),
            request_ref: "dsr-2".into(),
            on_time: false,
            latency_hours: 30,
        });
        let window = window_of(&buyer, payloads);
        let profile = score_history(&buyer, &window, &ScoringConfig::default()).unwrap();

        // 50 + 2 streak credits (6) + on-time (4) - missed (20)
        assert_eq!(profile.score, 40);
        assert_eq!(profile.counters.interactions, 40);
        assert_eq!(profile.counters.dsr_on_time, 1);
        assert_eq!(profile.counters.dsr_missed, 1);
        assert_eq!(profile.counters.mean_dsr_latency_hours, 20);
    }

    #[test]
    fn test_release_counts_once() {
        let buyer = BuyerId::new("acme");
        let config = ScoringConfig::default();
        let mut payloads = vec![onboarded(&buyer)];
        payloads.extend(
            (0..config.weights.clean_streak_len).flat_map(|_| [granted(&buyer), issued(&buyer)]),
        );
        let profile = score_history(&buyer, &window_of(&buyer, payloads), &config).unwrap();

        assert_eq!(profile.counters.interactions, config.weights.clean_streak_len);
        assert_eq!(
            i32::from(profile.score),
            i32::from(config.baseline) + config.weights.clean_streak_credit
        );
    }

    #[test]
    fn test_affects_score() {
        let buyer = BuyerId::new("acme");
        assert!(affects_score(&issued(&buyer)));
        assert!(!affects_score(&granted(&buyer)));
        assert!(!affects_score(&onboarded(&buyer)));
        assert!(affects_score(&AuditPayload::PolicyViolation {
            buyer_id: buyer.clone(),
            description: "late deletion".into(),
        }));
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let buyer = BuyerId::new("acme");
        let window = window_of(&buyer, vec![onboarded(&buyer), granted(&buyer)]);
        let config = ScoringConfig::default();
        assert_eq!(
            score_history(&buyer, &window, &config),
            score_history(&buyer, &window, &config)
        );
    }
}
