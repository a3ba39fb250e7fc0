//! End-to-end consent flows against the in-memory engine

mod common;

use std::time::Duration as StdDuration;

use chrono::Duration;
use serde_json::json;

use common::*;
use consent_ledger::domain::{
    AccessRequest, Actor, AnonymizationLevel, AuditAction, AuditPayload, Decision,
    DecisionOutcome, DenialReason, RevocationReason, TrustTier,
};
use consent_ledger::trust::TrustWorkerMessage;
use consent_ledger::{BuyerId, CoreConfig, LedgerError};

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn scenario_a_allow_at_grant_level() {
    let (core, clock) = memory_core(CoreConfig::default()).await;
    let grant_id = core
        .record_grant(
            location_grant("research", AnonymizationLevel::Partial),
            Actor::user(&alice()),
        )
        .await
        .unwrap();

    clock.advance(Duration::minutes(5));
    let decision = core.evaluate(&location_request("research")).await.unwrap();

    assert_eq!(decision.outcome, DecisionOutcome::Allow);
    assert_eq!(decision.effective_level, Some(AnonymizationLevel::Partial));
    assert_eq!(decision.grant_id, Some(grant_id));
    assert_eq!(decision.trust_tier, TrustTier::Standard);
}

#[tokio::test]
async fn scenario_b_restrict_to_tier_floor() {
    let (core, clock) = memory_core(CoreConfig::default()).await;
    core.record_grant(
        location_grant("research", AnonymizationLevel::Partial),
        Actor::user(&alice()),
    )
    .await
    .unwrap();

    let profile = core
        .record_policy_violation(&acme(), "late deletion of expired data", ops())
        .await
        .unwrap();
    assert_eq!(profile.tier, TrustTier::Provisional);

    clock.advance(Duration::minutes(5));
    let decision = core.evaluate(&location_request("research")).await.unwrap();

    assert_eq!(decision.outcome, DecisionOutcome::Restrict);
    assert_eq!(decision.effective_level, Some(AnonymizationLevel::Full));
    assert_eq!(decision.grant_level, Some(AnonymizationLevel::Partial));
}

#[tokio::test]
async fn scenario_c_revoked_grant_is_no_consent() {
    let (core, clock) = memory_core(CoreConfig::default()).await;
    let grant_id = core
        .record_grant(
            location_grant("research", AnonymizationLevel::Partial),
            Actor::user(&alice()),
        )
        .await
        .unwrap();

    clock.advance(Duration::hours(1));
    core.revoke_grant(grant_id, Actor::user(&alice()), RevocationReason::UserRequest)
        .await
        .unwrap();

    clock.advance(Duration::hours(1));
    let decision = core.evaluate(&location_request("research")).await.unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Deny);
    assert_eq!(decision.reason, Some(DenialReason::NoConsent));

    let again = core
        .revoke_grant(grant_id, Actor::user(&alice()), RevocationReason::UserRequest)
        .await;
    assert!(matches!(again, Err(LedgerError::AlreadyRevoked(_))));
}

#[tokio::test]
async fn scenario_d_trust_floor_overrides_consent() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    core.record_grant(
        location_grant("research", AnonymizationLevel::None),
        Actor::user(&alice()),
    )
    .await
    .unwrap();

    for description in ["sold data to a broker", "ignored deletion request"] {
        core.record_policy_violation(&acme(), description, ops())
            .await
            .unwrap();
    }
    assert_eq!(
        core.trust_profile(&acme()).await.unwrap().tier,
        TrustTier::Untrusted
    );

    let decision = core.evaluate(&location_request("research")).await.unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Deny);
    assert_eq!(decision.reason, Some(DenialReason::TrustFloorNotMet));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_e_concurrent_revoke_never_observed_active() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    let grant_id = core
        .record_grant(
            location_grant("research", AnonymizationLevel::Partial),
            Actor::user(&alice()),
        )
        .await
        .unwrap();

    let mut validators = Vec::new();
    for _ in 0..8 {
        let core = core.clone();
        validators.push(tokio::spawn(async move {
            let mut decisions = Vec::new();
            for _ in 0..25 {
                let decision = core.evaluate(&location_request("research")).await.unwrap();
                decisions.push(decision);
                tokio::task::yield_now().await;
            }
            decisions
        }));
    }

    let revoker = {
        let core = core.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(2)).await;
            core.revoke_grant(grant_id, Actor::user(&alice()), RevocationReason::UserRequest)
                .await
                .unwrap()
        })
    };
    revoker.await.unwrap();

    let mut decisions: Vec<Decision> = Vec::new();
    for handle in validators {
        decisions.extend(handle.await.unwrap());
    }

    let head = core.audit().head().await.sequence;
    let entries = core.audit_entries(1, head).await.unwrap();
    let revocation_seq = entries
        .iter()
        .find(|e| e.action == AuditAction::GrantRevoked)
        .map(|e| e.sequence)
        .unwrap();

    for decision in &decisions {
        if decision.is_permitted() {
            assert!(
                decision.audit_sequence < revocation_seq,
                "grant observed active at {} after revocation at {}",
                decision.audit_sequence,
                revocation_seq
            );
        } else {
            assert!(decision.audit_sequence > revocation_seq);
            assert!(matches!(
                decision.reason,
                Some(DenialReason::NoConsent) | Some(DenialReason::StateChanged)
            ));
        }
    }

    let after = core.evaluate(&location_request("research")).await.unwrap();
    assert_eq!(after.reason, Some(DenialReason::NoConsent));
    assert!(core.verify_chain(1, u64::MAX).await.unwrap().intact);
}

// ============================================================================
// Decisions
// ============================================================================

#[tokio::test]
async fn test_purpose_and_scope_denials() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    core.record_grant(
        location_grant("research", AnonymizationLevel::Partial),
        Actor::user(&alice()),
    )
    .await
    .unwrap();

    let decision = core.evaluate(&location_request("advertising")).await.unwrap();
    assert_eq!(decision.reason, Some(DenialReason::PurposeMismatch));

    let request = AccessRequest::new(acme(), alice(), location(), "research")
        .with_scope(["heart_rate"]);
    let decision = core.evaluate(&request).await.unwrap();
    assert_eq!(decision.reason, Some(DenialReason::ScopeNotGranted));
}

#[tokio::test]
async fn test_every_decision_is_audited() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    core.record_grant(
        location_grant("research", AnonymizationLevel::Partial),
        Actor::user(&alice()),
    )
    .await
    .unwrap();

    let mut sequences = Vec::new();
    for purpose in ["research", "advertising", "research"] {
        let decision = core.evaluate(&location_request(purpose)).await.unwrap();
        sequences.push((decision.audit_sequence, decision.outcome));
    }

    for (sequence, outcome) in sequences {
        let entry = &core.audit_entries(sequence, sequence).await.unwrap()[0];
        let expected = if outcome == DecisionOutcome::Deny {
            AuditAction::AccessDenied
        } else {
            AuditAction::AccessGranted
        };
        assert_eq!(entry.action, expected);
    }
}

#[tokio::test]
async fn test_unknown_buyer_is_not_found() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    let request = AccessRequest::new(BuyerId::new("never-onboarded"), alice(), location(), "research")
        .with_scope(["lat"]);
    assert!(matches!(
        core.evaluate(&request).await,
        Err(LedgerError::BuyerNotFound(_))
    ));
}

#[tokio::test]
async fn test_elapsed_deadline_has_no_visible_effect() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    core.record_grant(
        location_grant("research", AnonymizationLevel::Partial),
        Actor::user(&alice()),
    )
    .await
    .unwrap();
    let head = core.audit().head().await;

    let result = core
        .evaluate_with_deadline(&location_request("research"), tokio::time::Instant::now())
        .await;
    assert!(matches!(result, Err(LedgerError::DeadlineExceeded(_))));
    assert_eq!(core.audit().head().await, head);
}

// ============================================================================
// Packaging
// ============================================================================

#[tokio::test]
async fn test_package_partial_location() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    core.record_grant(
        location_grant("research", AnonymizationLevel::Partial),
        Actor::user(&alice()),
    )
    .await
    .unwrap();

    let request = location_request("research");
    let decision = core.evaluate(&request).await.unwrap();
    let issue = core.package(&request, &decision).await.unwrap();

    assert_eq!(issue.package.applied_level, AnonymizationLevel::Partial);
    assert_eq!(issue.receipt.package_id, issue.package.package_id);
    assert_eq!(issue.receipt.payload_digest, issue.package.payload.digest);

    let payload = core
        .redeem(issue.package.package_id, issue.access_token.as_str())
        .await
        .unwrap();
    assert_ne!(payload.subject, alice().to_string());
    assert_eq!(payload.fields.get("zip"), Some(&json!("974**")));
    assert_eq!(payload.fields.get("lat"), Some(&json!(44.0)));
    assert_eq!(payload.fields.get("country"), Some(&json!("US")));
    assert!(!payload.fields.contains_key("street"));
    // Granted but not requested.
    assert!(!payload.fields.contains_key("city"));

    let entry = &core
        .audit_entries(issue.receipt.audit_sequence, issue.receipt.audit_sequence)
        .await
        .unwrap()[0];
    assert_eq!(entry.action, AuditAction::PackageIssued);
}

#[tokio::test]
async fn test_restricted_package_only_attributes() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    core.record_grant(
        location_grant("research", AnonymizationLevel::Partial),
        Actor::user(&alice()),
    )
    .await
    .unwrap();
    core.record_policy_violation(&acme(), "re-identification attempt", ops())
        .await
        .unwrap();

    let request = location_request("research");
    let decision = core.evaluate(&request).await.unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Restrict);

    let issue = core.package(&request, &decision).await.unwrap();
    assert_eq!(issue.package.applied_level, AnonymizationLevel::Full);
    let payload = core
        .redeem(issue.package.package_id, issue.access_token.as_str())
        .await
        .unwrap();
    assert_eq!(
        payload.fields.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["country"]
    );
}

#[tokio::test]
async fn test_health_partial_drops_sensitive() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    core.record_grant(
        consent_ledger::NewGrant::new(alice(), acme(), health(), "clinical-study")
            .with_scope(["name", "ssn", "diagnosis", "age", "weight_kg", "blood_type"])
            .with_level(AnonymizationLevel::Partial),
        Actor::user(&alice()),
    )
    .await
    .unwrap();

    let request = AccessRequest::new(acme(), alice(), health(), "clinical-study")
        .with_scope(["name", "ssn", "diagnosis", "age", "weight_kg", "blood_type"]);
    let decision = core.evaluate(&request).await.unwrap();
    let issue = core.package(&request, &decision).await.unwrap();
    let payload = core
        .redeem(issue.package.package_id, issue.access_token.as_str())
        .await
        .unwrap();

    assert_eq!(payload.fields.get("age"), Some(&json!("30-34")));
    assert_eq!(payload.fields.get("weight_kg"), Some(&json!("60-69")));
    assert_eq!(payload.fields.get("blood_type"), Some(&json!("O+")));
    for withheld in ["name", "ssn", "diagnosis"] {
        assert!(!payload.fields.contains_key(withheld));
    }
}

#[tokio::test]
async fn test_token_expiry_uses_configured_ttl() {
    let config = CoreConfig::default().with_token_ttl(Duration::minutes(30));
    let (core, clock) = memory_core(config).await;
    core.record_grant(
        location_grant("research", AnonymizationLevel::Partial),
        Actor::user(&alice()),
    )
    .await
    .unwrap();

    let request = location_request("research");
    let decision = core.evaluate(&request).await.unwrap();
    let issue = core.package(&request, &decision).await.unwrap();
    assert_eq!(
        issue.package.token_expires_at - issue.package.issued_at,
        Duration::minutes(30)
    );

    clock.advance(Duration::minutes(31));
    assert!(matches!(
        core.redeem(issue.package.package_id, issue.access_token.as_str())
            .await,
        Err(LedgerError::TokenExpired(_))
    ));
}

#[tokio::test]
async fn test_erased_package_cannot_be_redeemed() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    core.record_grant(
        location_grant("research", AnonymizationLevel::Partial),
        Actor::user(&alice()),
    )
    .await
    .unwrap();
    let request = location_request("research");
    let decision = core.evaluate(&request).await.unwrap();
    let issue = core.package(&request, &decision).await.unwrap();

    let entry = core
        .record_package_erasure(issue.package.package_id, Actor::user(&alice()))
        .await
        .unwrap();
    assert_eq!(entry.action, AuditAction::PackageErased);

    assert!(matches!(
        core.redeem(issue.package.package_id, issue.access_token.as_str())
            .await,
        Err(LedgerError::PackageNotFound(_))
    ));
}

// ============================================================================
// Trust signals
// ============================================================================

#[tokio::test]
async fn test_buyer_conduct_revocation_lowers_score() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    let user_revoked = core
        .record_grant(
            location_grant("research", AnonymizationLevel::Partial),
            Actor::user(&alice()),
        )
        .await
        .unwrap();
    let conduct_revoked = core
        .record_grant(
            location_grant("advertising", AnonymizationLevel::Partial),
            Actor::user(&alice()),
        )
        .await
        .unwrap();

    core.revoke_grant(user_revoked, Actor::user(&alice()), RevocationReason::UserRequest)
        .await
        .unwrap();
    assert_eq!(core.recompute_trust(&acme()).await.unwrap().score, 50);

    core.revoke_grant(
        conduct_revoked,
        Actor::user(&alice()),
        RevocationReason::BuyerConduct("contacted me directly".into()),
    )
    .await
    .unwrap();
    let profile = core.recompute_trust(&acme()).await.unwrap();
    assert_eq!(profile.score, 40);
    assert_eq!(profile.counters.buyer_attributed_declines, 1);
}

#[tokio::test]
async fn test_dsr_outcomes_and_rebuild() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    core.record_dsr_outcome(&acme(), "dsr-001", true, 12, ops())
        .await
        .unwrap();
    let profile = core
        .record_dsr_outcome(&acme(), "dsr-002", false, 960, ops())
        .await
        .unwrap();
    assert_eq!(profile.counters.dsr_on_time, 1);
    assert_eq!(profile.counters.dsr_missed, 1);
    assert_eq!(profile.score, 34);

    let rebuilt = core.rebuild_trust_profiles().await.unwrap();
    assert_eq!(rebuilt.len(), 1);
    assert_eq!(*rebuilt[0], *profile);

    assert!(matches!(
        core.record_dsr_outcome(&BuyerId::new("ghost"), "dsr-003", true, 1, ops())
            .await,
        Err(LedgerError::BuyerNotFound(_))
    ));
}

#[tokio::test]
async fn test_onboarding_is_idempotent() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    let head = core.audit().head().await.sequence;
    let profile = core.onboard_buyer(&acme(), ops()).await.unwrap();
    assert_eq!(profile.score, 50);
    assert_eq!(core.audit().head().await.sequence, head);
}

#[tokio::test]
async fn test_worker_recomputes_after_conduct_revocation() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    let (handle, control) = core.spawn_trust_worker();

    let grant_id = core
        .record_grant(
            location_grant("research", AnonymizationLevel::Partial),
            Actor::user(&alice()),
        )
        .await
        .unwrap();
    core.revoke_grant(
        grant_id,
        Actor::user(&alice()),
        RevocationReason::BuyerConduct("shared data without consent".into()),
    )
    .await
    .unwrap();

    let mut score = 50;
    for _ in 0..200 {
        score = core.trust_profile(&acme()).await.unwrap().score;
        if score != 50 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    assert_eq!(score, 40);

    control.send(TrustWorkerMessage::Shutdown).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_compliance_entries_are_chained() {
    let (core, _clock) = memory_core(CoreConfig::default()).await;
    core.record_policy_violation(&acme(), "late breach notice", ops())
        .await
        .unwrap();
    core.record_dsr_outcome(&acme(), "dsr-17", true, 4, ops())
        .await
        .unwrap();

    let verification = core.verify_chain(1, u64::MAX).await.unwrap();
    assert!(verification.intact);
    assert_eq!(verification.entries_checked, 3);

    let entries = core.audit_entries(1, 3).await.unwrap();
    assert!(matches!(
        entries[1].payload,
        AuditPayload::PolicyViolation { .. }
    ));
    assert_eq!(entries[2].prev_hash, entries[1].entry_hash);
}
