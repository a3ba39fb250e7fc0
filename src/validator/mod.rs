//! Consent validator
//!
//! Decides whether a buyer's access request may proceed and at what
//! anonymization level. Every decision, including denials, is backed by an
//! audit entry before it is returned.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::audit::AuditTrail;
use crate::config::TierPolicy;
use crate::domain::{
    AccessRequest, Actor, AuditPayload, ConsentGrant, Decision, DecisionOutcome, DenialReason,
    GrantId, TrustTier,
};
use crate::infra::{ensure_before, within_deadline, Clock, Result};
use crate::ledger::LedgerStore;
use crate::metrics::{metric_names, timed, MetricsRegistry};
use crate::trust::TrustEngine;

/// Re-reads allowed when a chosen grant changes state under us
const MAX_STATE_RETRIES: usize = 3;

pub struct ConsentValidator {
    ledger: Arc<LedgerStore>,
    trust: Arc<TrustEngine>,
    audit: Arc<AuditTrail>,
    policy: TierPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
}

impl ConsentValidator {
    pub fn new(
        ledger: Arc<LedgerStore>,
        trust: Arc<TrustEngine>,
        audit: Arc<AuditTrail>,
        policy: TierPolicy,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            ledger,
            trust,
            audit,
            policy,
            clock,
            metrics,
        }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    pub async fn evaluate(&self, request: &AccessRequest) -> Result<Decision> {
        self.evaluate_with_deadline(request, None).await
    }

    /// Evaluate a request under an optional caller deadline.
    ///
    /// Fails with `DeadlineExceeded` (and appends nothing) if the deadline
    /// passes before the decision is committed.
    #[instrument(
        skip(self, request),
        fields(request_id = %request.request_id, buyer_id = %request.buyer_id, category = %request.category)
    )]
    pub async fn evaluate_with_deadline(
        &self,
        request: &AccessRequest,
        deadline: Option<Instant>,
    ) -> Result<Decision> {
        request.validate()?;

        let decision = timed(&self.metrics, metric_names::DECISION_LATENCY, async {
            let profile =
                within_deadline(deadline, "trust lookup", self.trust.current(&request.buyer_id))
                    .await??;

            if !self.policy.admits(profile.tier) {
                let detail = format!(
                    "tier {} is below minimum {}",
                    profile.tier, self.policy.minimum_tier
                );
                return self
                    .deny(
                        request,
                        profile.tier,
                        DenialReason::TrustFloorNotMet,
                        None,
                        Some(detail),
                        deadline,
                    )
                    .await;
            }

            self.evaluate_consent(request, profile.tier, deadline).await
        })
        .await?;

        self.metrics.record_decision(decision.outcome).await;
        Ok(decision)
    }

    async fn evaluate_consent(
        &self,
        request: &AccessRequest,
        tier: TrustTier,
        deadline: Option<Instant>,
    ) -> Result<Decision> {
        for attempt in 0..MAX_STATE_RETRIES {
            let grants = within_deadline(
                deadline,
                "grant lookup",
                self.ledger.active_grants_for(
                    &request.user_id,
                    &request.buyer_id,
                    &request.category,
                ),
            )
            .await??;

            if grants.is_empty() {
                return self
                    .deny(request, tier, DenialReason::NoConsent, None, None, deadline)
                    .await;
            }

            // Newest first, so this is the most recent matching grant.
            let Some(grant) = grants.into_iter().find(|g| g.purpose == request.purpose) else {
                return self
                    .deny(request, tier, DenialReason::PurposeMismatch, None, None, deadline)
                    .await;
            };

            if grant.scope_intersection(&request.scope).is_empty() {
                return self
                    .deny(
                        request,
                        tier,
                        DenialReason::ScopeNotGranted,
                        Some(grant.grant_id),
                        None,
                        deadline,
                    )
                    .await;
            }

            // Hold the shared lock from the re-read through the audit commit
            // so a revocation cannot land in between.
            let lock = self.ledger.grant_lock(&grant.grant_id).await;
            let _guard = within_deadline(deadline, "grant lock", lock.read_owned()).await?;
            let current =
                within_deadline(deadline, "grant re-read", self.ledger.get_grant(&grant.grant_id))
                    .await??;

            match current {
                Some(current) if current.is_active_at(self.clock.now()) => {
                    return self.permit(request, tier, &current, deadline).await;
                }
                _ => {
                    warn!(grant_id = %grant.grant_id, attempt, "grant changed state during evaluation");
                }
            }
        }

        self.deny(request, tier, DenialReason::StateChanged, None, None, deadline)
            .await
    }

    async fn permit(
        &self,
        request: &AccessRequest,
        tier: TrustTier,
        grant: &ConsentGrant,
        deadline: Option<Instant>,
    ) -> Result<Decision> {
        let floor = self.policy.floor_for(tier);
        let grant_level = grant.requested_level;
        let effective_level = grant_level.stricter(floor);
        let outcome = if grant_level.is_weaker_than(&floor) {
            DecisionOutcome::Restrict
        } else {
            DecisionOutcome::Allow
        };

        ensure_before(deadline, "decision commit")?;
        let entry = self
            .audit
            .append(
                Actor::buyer(&request.buyer_id),
                AuditPayload::AccessGranted {
                    request_id: request.request_id,
                    grant_id: grant.grant_id,
                    user_id: request.user_id.clone(),
                    buyer_id: request.buyer_id.clone(),
                    category: request.category.clone(),
                    purpose: request.purpose.clone(),
                    outcome,
                    effective_level,
                    trust_tier: tier,
                },
            )
            .await?;

        info!(
            outcome = %outcome,
            grant_id = %grant.grant_id,
            level = %effective_level,
            sequence = entry.sequence,
            "access permitted"
        );

        Ok(Decision {
            request_id: request.request_id,
            outcome,
            reason: None,
            effective_level: Some(effective_level),
            grant_id: Some(grant.grant_id),
            grant_level: Some(grant_level),
            trust_tier: tier,
            granted_scope: grant.scope_intersection(&request.scope),
            audit_sequence: entry.sequence,
            decided_at: entry.recorded_at,
        })
    }

    async fn deny(
        &self,
        request: &AccessRequest,
        tier: TrustTier,
        reason: DenialReason,
        grant_id: Option<GrantId>,
        detail: Option<String>,
        deadline: Option<Instant>,
    ) -> Result<Decision> {
        ensure_before(deadline, "decision commit")?;
        let entry = self
            .audit
            .append(
                Actor::buyer(&request.buyer_id),
                AuditPayload::AccessDenied {
                    request_id: request.request_id,
                    grant_id,
                    user_id: request.user_id.clone(),
                    buyer_id: request.buyer_id.clone(),
                    category: request.category.clone(),
                    purpose: request.purpose.clone(),
                    reason,
                    trust_tier: tier,
                    detail,
                },
            )
            .await?;

        warn!(reason = %reason, sequence = entry.sequence, "access denied");

        Ok(Decision {
            request_id: request.request_id,
            outcome: DecisionOutcome::Deny,
            reason: Some(reason),
            effective_level: None,
            grant_id,
            grant_level: None,
            trust_tier: tier,
            granted_scope: Default::default(),
            audit_sequence: entry.sequence,
            decided_at: entry.recorded_at,
        })
    }
}
