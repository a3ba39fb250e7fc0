use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, SubsecRound};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::schema::SchemaRegistry;
use crate::audit::AuditTrail;
use crate::config::TierPolicy;
use crate::crypto::{digests_match, generate_access_token, hash_token, payload_digest, random_ref};
use crate::domain::{
    AccessRequest, Actor, AnonymizationLevel, AuditPayload, ConsentGrant, DataPackage, Decision,
    DeliveryReceipt, DenialReason, GrantId, PackageId, PackageIssue, PayloadDescriptor,
    ReleasedPayload, TrustTier,
};
use crate::infra::{
    ensure_before, within_deadline, Clock, DataSource, LedgerError, LedgerMutation, LedgerStorage,
    PayloadVault, Result,
};
use crate::ledger::LedgerStore;
use crate::metrics::{metric_names, timed, MetricsRegistry};
use crate::trust::TrustEngine;

/// Collaborators the pipeline reads from and writes to
pub struct PackagingDeps {
    pub storage: Arc<dyn LedgerStorage>,
    pub ledger: Arc<LedgerStore>,
    pub trust: Arc<TrustEngine>,
    pub audit: Arc<AuditTrail>,
    pub vault: Arc<dyn PayloadVault>,
    pub source: Arc<dyn DataSource>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Turns a permitted decision into a released, audited data package.
pub struct PackagingPipeline {
    deps: PackagingDeps,
    schema: SchemaRegistry,
    policy: TierPolicy,
    token_ttl: Duration,
}

impl PackagingPipeline {
    pub fn new(
        deps: PackagingDeps,
        schema: SchemaRegistry,
        policy: TierPolicy,
        token_ttl: Duration,
    ) -> Self {
        Self {
            deps,
            schema,
            policy,
            token_ttl,
        }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub async fn package(&self, request: &AccessRequest, decision: &Decision) -> Result<PackageIssue> {
        self.package_with_deadline(request, decision, None).await
    }

    /// Package data for a permitted decision.
    ///
    /// The grant is re-read under its shared lock immediately before
    /// packaging and the lock is held through the `package_issued` commit.
    /// Every failure appends an `access_denied` entry; an expired deadline
    /// appends nothing.
    #[instrument(
        skip(self, request, decision),
        fields(request_id = %request.request_id, buyer_id = %request.buyer_id)
    )]
    pub async fn package_with_deadline(
        &self,
        request: &AccessRequest,
        decision: &Decision,
        deadline: Option<Instant>,
    ) -> Result<PackageIssue> {
        let metrics = self.deps.metrics.clone();
        let result = timed(
            &metrics,
            metric_names::PACKAGE_LATENCY,
            self.run(request, decision, deadline),
        )
        .await;
        let result = match result {
            Err(e) => Err(self.audit_failure(request, decision, e, deadline).await),
            ok => ok,
        };

        match &result {
            Ok(issue) => {
                metrics.inc_counter(metric_names::PACKAGES_ISSUED).await;
                info!(
                    package_id = %issue.package.package_id,
                    level = %issue.package.applied_level,
                    sequence = issue.receipt.audit_sequence,
                    "package issued"
                );
            }
            Err(e) => {
                metrics.inc_counter(metric_names::PACKAGES_FAILED).await;
                warn!(error = %e, "packaging failed");
            }
        }
        result
    }

    async fn run(
        &self,
        request: &AccessRequest,
        decision: &Decision,
        deadline: Option<Instant>,
    ) -> Result<PackageIssue> {
        let (grant_id, decided_level) = match (decision.grant_id, decision.effective_level) {
            (Some(grant_id), Some(level))
                if decision.is_permitted() && decision.request_id == request.request_id =>
            {
                (grant_id, level)
            }
            _ => {
                return Err(LedgerError::NotReleasable(format!(
                    "decision {} for request {} does not permit release",
                    decision.outcome, decision.request_id
                )))
            }
        };

        self.deps.audit.alarm().check().await?;

        let lock = self.deps.ledger.grant_lock(&grant_id).await;
        let _guard = within_deadline(deadline, "grant lock", lock.read_owned()).await?;

        let grant = within_deadline(deadline, "grant re-read", self.deps.ledger.get_grant(&grant_id))
            .await??
            .ok_or(LedgerError::GrantNotFound(grant_id))?;

        if !grant_covers(&grant, request) {
            return Err(LedgerError::NotReleasable(format!(
                "grant {grant_id} does not cover request {}",
                request.request_id
            )));
        }

        if !grant.is_active_at(self.deps.clock.now()) {
            ensure_before(deadline, "denial commit")?;
            self.record_failure(
                request,
                Some(grant_id),
                decision.trust_tier,
                DenialReason::StateChanged,
                "grant no longer active".into(),
            )
            .await?;
            return Err(LedgerError::StateChanged(grant_id));
        }

        let profile = within_deadline(
            deadline,
            "trust lookup",
            self.deps.trust.current(&request.buyer_id),
        )
        .await??;
        if !self.policy.admits(profile.tier) {
            ensure_before(deadline, "denial commit")?;
            self.record_failure(
                request,
                Some(grant_id),
                profile.tier,
                DenialReason::TrustFloorNotMet,
                format!("tier {} fell below minimum", profile.tier),
            )
            .await?;
            return Err(LedgerError::TrustFloor(request.buyer_id.to_string()));
        }

        // Never weaker than the decision, the grant, or the buyer's current floor.
        let applied_level = decided_level
            .stricter(grant.requested_level)
            .stricter(self.policy.floor_for(profile.tier));

        let (released, field_count) = self
            .build_release(request, &grant, applied_level, deadline)
            .await?;

        let digest = payload_digest(&released)?;
        let payload_ref = random_ref("pkg");
        let stored = within_deadline(
            deadline,
            "payload store",
            self.deps.vault.put(&payload_ref, &released),
        )
        .await
        .and_then(|put| put);
        if let Err(e) = stored {
            // A put cut short by the deadline may already have landed.
            self.discard_payload(&payload_ref).await;
            return Err(e);
        }

        let issued_at = self.deps.clock.now().trunc_subsecs(6);
        let (access_token, token_hash) = generate_access_token();
        let package = DataPackage {
            package_id: PackageId::new(),
            request_id: request.request_id,
            grant_id,
            buyer_id: request.buyer_id.clone(),
            user_id: request.user_id.clone(),
            applied_level,
            payload: PayloadDescriptor {
                payload_ref: payload_ref.clone(),
                digest,
                field_count,
            },
            issued_at,
            token_expires_at: issued_at + self.token_ttl,
            token_hash,
        };

        if let Err(e) = ensure_before(deadline, "package commit") {
            self.discard_payload(&payload_ref).await;
            return Err(e);
        }

        let payload = AuditPayload::PackageIssued {
            package_id: package.package_id,
            request_id: request.request_id,
            grant_id,
            user_id: request.user_id.clone(),
            buyer_id: request.buyer_id.clone(),
            applied_level,
            payload_digest: digest,
            token_expires_at: package.token_expires_at,
        };
        let entry = match self
            .deps
            .audit
            .record(
                Actor::buyer(&request.buyer_id),
                payload,
                LedgerMutation::Package(package.clone()),
            )
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                self.discard_payload(&payload_ref).await;
                return Err(e);
            }
        };

        let receipt = DeliveryReceipt {
            package_id: package.package_id,
            request_id: request.request_id,
            buyer_id: request.buyer_id.clone(),
            applied_level,
            payload_digest: digest,
            field_count,
            issued_at,
            token_expires_at: package.token_expires_at,
            audit_sequence: entry.sequence,
        };

        Ok(PackageIssue {
            package,
            access_token,
            receipt,
        })
    }

    /// Fetch, transform and verify the payload. Scope is limited to the
    /// requested data points the current grant still covers.
    async fn build_release(
        &self,
        request: &AccessRequest,
        grant: &ConsentGrant,
        level: AnonymizationLevel,
        deadline: Option<Instant>,
    ) -> Result<(ReleasedPayload, u32)> {
        let scope = grant.scope_intersection(&request.scope);
        if scope.is_empty() {
            return Err(LedgerError::NotReleasable(
                "grant no longer covers any requested data point".into(),
            ));
        }

        let raw: BTreeMap<String, Value> = within_deadline(
            deadline,
            "data fetch",
            self.deps
                .source
                .fetch(&request.user_id, &request.category, &scope),
        )
        .await??
        .into_iter()
        .filter(|(name, _)| scope.contains(name))
        .collect();

        let released = self
            .schema
            .transform(&request.user_id, &request.category, level, &raw);
        self.schema
            .verify_release(&request.user_id, &request.category, &raw, &released)?;

        let field_count = u32::try_from(released.fields.len())
            .map_err(|_| LedgerError::Internal("field count overflow".into()))?;
        debug!(raw = raw.len(), released = field_count, %level, "payload transformed");
        Ok((released, field_count))
    }

    /// Audit a failure `run` has not already recorded and hand the error
    /// back. State and trust refusals are recorded where they are detected;
    /// deadline expiry is never recorded.
    async fn audit_failure(
        &self,
        request: &AccessRequest,
        decision: &Decision,
        error: LedgerError,
        deadline: Option<Instant>,
    ) -> LedgerError {
        let reason = match &error {
            LedgerError::DeadlineExceeded(_)
            | LedgerError::StateChanged(_)
            | LedgerError::TrustFloor(_) => return error,
            LedgerError::ChainIntegrity { .. } => DenialReason::ServiceHalted,
            LedgerError::GrantNotFound(_) => DenialReason::NoConsent,
            _ => DenialReason::PackagingFailed,
        };
        if let Err(expired) = ensure_before(deadline, "denial commit") {
            warn!(error = %error, "deadline passed before packaging failure was recorded");
            return expired;
        }
        match self
            .record_failure(
                request,
                decision.grant_id,
                decision.trust_tier,
                reason,
                error.public_code().to_string(),
            )
            .await
        {
            Ok(()) => error,
            Err(audit_error) => {
                warn!(error = %error, "packaging failure could not be audited");
                audit_error
            }
        }
    }

    async fn record_failure(
        &self,
        request: &AccessRequest,
        grant_id: Option<GrantId>,
        tier: TrustTier,
        reason: DenialReason,
        detail: String,
    ) -> Result<()> {
        let entry = self
            .deps
            .audit
            .append(
                Actor::system("packaging"),
                AuditPayload::AccessDenied {
                    request_id: request.request_id,
                    grant_id,
                    user_id: request.user_id.clone(),
                    buyer_id: request.buyer_id.clone(),
                    category: request.category.clone(),
                    purpose: request.purpose.clone(),
                    reason,
                    trust_tier: tier,
                    detail: Some(detail),
                },
            )
            .await?;
        warn!(reason = %reason, sequence = entry.sequence, "packaging refused");
        Ok(())
    }

    async fn discard_payload(&self, payload_ref: &str) {
        if let Err(e) = self.deps.vault.remove(payload_ref).await {
            warn!(payload_ref, error = %e, "failed to discard orphaned payload");
        }
    }

    /// Exchange an access token for the released payload.
    ///
    /// The token is checked before expiry so an invalid token learns
    /// nothing about the package.
    #[instrument(skip(self, token), fields(package_id = %package_id))]
    pub async fn redeem(&self, package_id: PackageId, token: &str) -> Result<ReleasedPayload> {
        let result = self.redeem_inner(package_id, token).await;
        let counter = if result.is_ok() {
            metric_names::TOKENS_REDEEMED
        } else {
            metric_names::TOKENS_REJECTED
        };
        self.deps.metrics.inc_counter(counter).await;
        result
    }

    async fn redeem_inner(&self, package_id: PackageId, token: &str) -> Result<ReleasedPayload> {
        let package = self
            .deps
            .storage
            .get_package(&package_id)
            .await?
            .ok_or(LedgerError::PackageNotFound(package_id))?;

        if !digests_match(&hash_token(token), &package.token_hash) {
            return Err(LedgerError::InvalidToken);
        }
        if !package.token_valid_at(self.deps.clock.now()) {
            return Err(LedgerError::TokenExpired(package_id));
        }

        let payload = self
            .deps
            .vault
            .get(&package.payload.payload_ref)
            .await?
            .ok_or(LedgerError::PackageNotFound(package_id))?;

        if payload_digest(&payload)? != package.payload.digest {
            return Err(LedgerError::ReleaseVerification(
                "stored payload does not match its digest".into(),
            ));
        }
        Ok(payload)
    }
}

fn grant_covers(grant: &ConsentGrant, request: &AccessRequest) -> bool {
    grant.user_id == request.user_id
        && grant.buyer_id == request.buyer_id
        && grant.category == request.category
        && grant.purpose == request.purpose
}
