//! Ledger store
//!
//! Authoritative record of consent state. Grants and revocations are
//! committed together with their audit entries. Per-grant ordering is total:
//! a revocation holds the grant's write lock until it is durable, and
//! readers that must not race a revocation hold the read lock.

mod locks;

pub use locks::KeyedLocks;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::audit::AuditTrail;
use crate::domain::{
    Actor, AuditPayload, BuyerId, ConsentGrant, DataCategory, GrantId, GrantRevocation, NewGrant,
    RevocationReason, UserId,
};
use crate::infra::{Clock, LedgerError, LedgerMutation, LedgerStorage, Result};
use crate::metrics::{metric_names, MetricsRegistry};

type PurposeKey = (UserId, BuyerId, DataCategory, String);

pub struct LedgerStore {
    storage: Arc<dyn LedgerStorage>,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    grant_locks: KeyedLocks<GrantId>,
    purpose_locks: KeyedLocks<PurposeKey>,
}

impl LedgerStore {
    pub fn new(
        storage: Arc<dyn LedgerStorage>,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            storage,
            audit,
            clock,
            metrics,
            grant_locks: KeyedLocks::new(),
            purpose_locks: KeyedLocks::new(),
        }
    }

    /// Record a new grant.
    ///
    /// Fails with `InvalidGrant` on an empty scope or purpose, an expiry not
    /// after issuance, or an existing active grant for the same
    /// (user, buyer, category, purpose).
    #[instrument(skip(self, grant, actor), fields(user_id = %grant.user_id, buyer_id = %grant.buyer_id, category = %grant.category))]
    pub async fn record_grant(&self, grant: NewGrant, actor: Actor) -> Result<GrantId> {
        let granted_at = self.clock.now();
        grant.validate(granted_at)?;

        let key = (
            grant.user_id.clone(),
            grant.buyer_id.clone(),
            grant.category.clone(),
            grant.purpose.clone(),
        );
        let lock = self.purpose_locks.lock_for(&key).await;
        let _guard = lock.write_owned().await;

        let existing = self
            .storage
            .grants_for(&grant.user_id, &grant.buyer_id, &grant.category)
            .await?;
        if let Some(active) = existing
            .iter()
            .find(|g| g.purpose == grant.purpose && g.is_active_at(granted_at))
        {
            return Err(LedgerError::InvalidGrant(format!(
                "active grant {} already covers purpose '{}'",
                active.grant_id, grant.purpose
            )));
        }

        let grant_id = GrantId::new();
        let grant = grant.into_grant(grant_id, granted_at);
        let payload = AuditPayload::GrantRecorded {
            grant: grant.clone(),
        };
        let entry = self
            .audit
            .record(actor, payload, LedgerMutation::Grant(grant))
            .await?;

        self.metrics.inc_counter(metric_names::GRANTS_RECORDED).await;
        info!(grant_id = %grant_id, sequence = entry.sequence, "grant recorded");
        Ok(grant_id)
    }

    /// Append a terminal revocation for a grant.
    ///
    /// Holds the grant's write lock until the revocation is durable, so no
    /// concurrent validation or packaging can observe the grant as active
    /// afterwards.
    #[instrument(skip(self, actor, reason), fields(grant_id = %grant_id))]
    pub async fn record_revocation(
        &self,
        grant_id: GrantId,
        actor: Actor,
        reason: RevocationReason,
    ) -> Result<DateTime<Utc>> {
        let lock = self.grant_lock(&grant_id).await;
        let _guard = lock.write_owned().await;

        let grant = self
            .storage
            .get_grant(&grant_id)
            .await?
            .ok_or(LedgerError::GrantNotFound(grant_id))?;
        if grant.is_revoked() {
            return Err(LedgerError::AlreadyRevoked(grant_id));
        }

        let revoked_at = self.clock.now();
        let revocation = GrantRevocation {
            grant_id,
            revoked_at,
            actor: actor.clone(),
            reason: reason.clone(),
        };
        let payload = AuditPayload::GrantRevoked {
            grant_id,
            user_id: grant.user_id,
            buyer_id: grant.buyer_id,
            category: grant.category,
            reason,
            revoked_at,
        };
        let entry = self
            .audit
            .record(actor, payload, LedgerMutation::Revocation(revocation))
            .await?;

        self.metrics.inc_counter(metric_names::GRANTS_REVOKED).await;
        info!(sequence = entry.sequence, "grant revoked");
        Ok(revoked_at)
    }

    /// Currently active grants for a tuple, newest first
    pub async fn active_grants_for(
        &self,
        user_id: &UserId,
        buyer_id: &BuyerId,
        category: &DataCategory,
    ) -> Result<Vec<ConsentGrant>> {
        let now = self.clock.now();
        let mut grants: Vec<ConsentGrant> = self
            .storage
            .grants_for(user_id, buyer_id, category)
            .await?
            .into_iter()
            .filter(|g| g.is_active_at(now))
            .collect();
        grants.sort_by(|a, b| {
            b.granted_at
                .cmp(&a.granted_at)
                .then_with(|| b.grant_id.cmp(&a.grant_id))
        });
        Ok(grants)
    }

    pub async fn get_grant(&self, grant_id: &GrantId) -> Result<Option<ConsentGrant>> {
        self.storage.get_grant(grant_id).await
    }

    /// Per-grant lock shared with the validator and packaging pipeline
    pub(crate) async fn grant_lock(&self, grant_id: &GrantId) -> Arc<RwLock<()>> {
        self.grant_locks.lock_for(grant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnonymizationLevel, AuditAction};
    use crate::infra::{ManualClock, MemoryStorage};
    use chrono::{Duration, TimeZone};

    struct Fixture {
        clock: Arc<ManualClock>,
        audit: Arc<AuditTrail>,
        ledger: LedgerStore,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let storage: Arc<dyn LedgerStorage> = Arc::new(MemoryStorage::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let audit = Arc::new(
            AuditTrail::open(storage.clone(), clock.clone(), metrics.clone())
                .await
                .unwrap(),
        );
        let ledger = LedgerStore::new(storage, audit.clone(), clock.clone(), metrics);
        Fixture {
            clock,
            audit,
            ledger,
        }
    }

    fn location_grant(purpose: &str) -> NewGrant {
        NewGrant::new(
            UserId::new("u1"),
            BuyerId::new("acme"),
            DataCategory::new("location"),
            purpose,
        )
        .with_scope(["lat", "lon"])
        .with_level(AnonymizationLevel::Partial)
    }

    #[tokio::test]
    async fn test_record_grant_appends_audit_entry() {
        let f = fixture().await;
        let user = Actor::user(&UserId::new("u1"));
        let grant_id = f
            .ledger
            .record_grant(location_grant("research"), user)
            .await
            .unwrap();

        let stored = f.ledger.get_grant(&grant_id).await.unwrap().unwrap();
        assert_eq!(stored.purpose, "research");

        let entries = f.audit.read_range(1, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::GrantRecorded);
        assert_eq!(entries[0].grant_id(), Some(grant_id));
    }

    #[tokio::test]
    async fn test_invalid_grant_leaves_no_trace() {
        let f = fixture().await;
        let mut grant = location_grant("research");
        grant.scope.clear();
        let result = f
            .ledger
            .record_grant(grant, Actor::user(&UserId::new("u1")))
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidGrant(_))));
        assert!(f.audit.head().await.is_genesis());
    }

    #[tokio::test]
    async fn test_duplicate_active_purpose_rejected() {
        let f = fixture().await;
        let actor = Actor::user(&UserId::new("u1"));
        f.ledger
            .record_grant(location_grant("research"), actor.clone())
            .await
            .unwrap();

        let dup = f
            .ledger
            .record_grant(location_grant("research"), actor.clone())
            .await;
        assert!(matches!(dup, Err(LedgerError::InvalidGrant(_))));

        // A distinct purpose is fine.
        f.ledger
            .record_grant(location_grant("marketing"), actor)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_revocation_is_terminal() {
        let f = fixture().await;
        let actor = Actor::user(&UserId::new("u1"));
        let grant_id = f
            .ledger
            .record_grant(location_grant("research"), actor.clone())
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(10));
        let revoked_at = f
            .ledger
            .record_revocation(grant_id, actor.clone(), RevocationReason::UserRequest)
            .await
            .unwrap();
        assert_eq!(revoked_at, f.clock.now());

        let again = f
            .ledger
            .record_revocation(grant_id, actor.clone(), RevocationReason::UserRequest)
            .await;
        assert!(matches!(again, Err(LedgerError::AlreadyRevoked(id)) if id == grant_id));

        let missing = f
            .ledger
            .record_revocation(GrantId::new(), actor.clone(), RevocationReason::UserRequest)
            .await;
        assert!(matches!(missing, Err(LedgerError::GrantNotFound(_))));

        let active = f
            .ledger
            .active_grants_for(
                &UserId::new("u1"),
                &BuyerId::new("acme"),
                &DataCategory::new("location"),
            )
            .await
            .unwrap();
        assert!(active.is_empty());

        // Re-granting the same purpose after revocation is allowed.
        f.ledger
            .record_grant(location_grant("research"), actor)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_active_grants_newest_first_and_expiry() {
        let f = fixture().await;
        let actor = Actor::user(&UserId::new("u1"));
        let expiring = location_grant("ads").with_expiry(f.clock.now() + Duration::hours(1));
        let older = f
            .ledger
            .record_grant(expiring, actor.clone())
            .await
            .unwrap();
        f.clock.advance(Duration::minutes(5));
        let newer = f
            .ledger
            .record_grant(location_grant("research"), actor)
            .await
            .unwrap();

        let tuple = (
            UserId::new("u1"),
            BuyerId::new("acme"),
            DataCategory::new("location"),
        );
        let active = f
            .ledger
            .active_grants_for(&tuple.0, &tuple.1, &tuple.2)
            .await
            .unwrap();
        assert_eq!(
            active.iter().map(|g| g.grant_id).collect::<Vec<_>>(),
            vec![newer, older]
        );

        f.clock.advance(Duration::hours(2));
        let active = f
            .ledger
            .active_grants_for(&tuple.0, &tuple.1, &tuple.2)
            .await
            .unwrap();
        assert_eq!(
            active.iter().map(|g| g.grant_id).collect::<Vec<_>>(),
            vec![newer]
        );
    }
}
