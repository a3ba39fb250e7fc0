//! Consent core
//!
//! Wires storage, audit trail, ledger, trust engine, validator and
//! packaging pipeline together and exposes the engine's operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, instrument};

use crate::audit::AuditTrail;
use crate::config::CoreConfig;
use crate::domain::{
    AccessRequest, Actor, AuditEntry, AuditPayload, BuyerId, ChainVerification, ConsentGrant,
    DataCategory, Decision, GrantId, NewGrant, PackageId, PackageIssue, ReleasedPayload,
    RevocationReason, TrustProfile, UserId,
};
use crate::infra::{
    Clock, DataSource, LedgerError, LedgerStorage, MemoryPayloadVault, MemoryStorage,
    PayloadVault, Result, SqlitePayloadVault, SqliteStorage,
};
use crate::ledger::LedgerStore;
use crate::metrics::MetricsRegistry;
use crate::packaging::{PackagingDeps, PackagingPipeline, SchemaRegistry};
use crate::trust::{spawn_trust_worker, TrustEngine, TrustWorkerMessage};
use crate::validator::ConsentValidator;

pub struct ConsentCore {
    config: CoreConfig,
    storage: Arc<dyn LedgerStorage>,
    vault: Arc<dyn PayloadVault>,
    audit: Arc<AuditTrail>,
    ledger: Arc<LedgerStore>,
    trust: Arc<TrustEngine>,
    validator: ConsentValidator,
    packaging: PackagingPipeline,
    metrics: Arc<MetricsRegistry>,
}

impl ConsentCore {
    /// Engine over in-memory storage and vault
    pub async fn in_memory(
        config: CoreConfig,
        source: Arc<dyn DataSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_storage(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryPayloadVault::new()),
            source,
            clock,
        )
        .await
    }

    /// Engine over the SQLite database named by `config.database_url`.
    /// Runs pending migrations first.
    pub async fn open_sqlite(
        config: CoreConfig,
        source: Arc<dyn DataSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let url = config.database_url.clone().ok_or_else(|| {
            LedgerError::Configuration("CONSENT_DATABASE_URL is not set".into())
        })?;
        let storage = SqliteStorage::connect(&url).await?;
        storage.initialize().await?;
        let vault = SqlitePayloadVault::new(storage.pool().clone());
        Self::with_storage(config, Arc::new(storage), Arc::new(vault), source, clock).await
    }

    pub async fn with_storage(
        config: CoreConfig,
        storage: Arc<dyn LedgerStorage>,
        vault: Arc<dyn PayloadVault>,
        source: Arc<dyn DataSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsRegistry::new());

        let audit = Arc::new(AuditTrail::open(storage.clone(), clock.clone(), metrics.clone()).await?);
        let ledger = Arc::new(LedgerStore::new(
            storage.clone(),
            audit.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let trust = Arc::new(TrustEngine::new(
            storage.clone(),
            audit.clone(),
            config.scoring.clone(),
            metrics.clone(),
        ));
        let buyers = trust.warm_start().await?;

        let validator = ConsentValidator::new(
            ledger.clone(),
            trust.clone(),
            audit.clone(),
            config.tier_policy.clone(),
            clock.clone(),
            metrics.clone(),
        );
        let packaging = PackagingPipeline::new(
            PackagingDeps {
                storage: storage.clone(),
                ledger: ledger.clone(),
                trust: trust.clone(),
                audit: audit.clone(),
                vault: vault.clone(),
                source,
                clock,
                metrics: metrics.clone(),
            },
            SchemaRegistry::default(),
            config.tier_policy.clone(),
            config.token_ttl,
        );

        info!(
            head = audit.head().await.sequence,
            buyers,
            "consent core ready"
        );

        Ok(Self {
            config,
            storage,
            vault,
            audit,
            ledger,
            trust,
            validator,
            packaging,
            metrics,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn trust(&self) -> &Arc<TrustEngine> {
        &self.trust
    }

    // Ledger

    pub async fn record_grant(&self, grant: NewGrant, actor: Actor) -> Result<GrantId> {
        self.ledger.record_grant(grant, actor).await
    }

    pub async fn revoke_grant(
        &self,
        grant_id: GrantId,
        actor: Actor,
        reason: RevocationReason,
    ) -> Result<DateTime<Utc>> {
        self.ledger.record_revocation(grant_id, actor, reason).await
    }

    pub async fn active_grants(
        &self,
        user_id: &UserId,
        buyer_id: &BuyerId,
        category: &DataCategory,
    ) -> Result<Vec<ConsentGrant>> {
        self.ledger.active_grants_for(user_id, buyer_id, category).await
    }

    pub async fn get_grant(&self, grant_id: &GrantId) -> Result<Option<ConsentGrant>> {
        self.ledger.get_grant(grant_id).await
    }

    // Decisions and packaging

    pub async fn evaluate(&self, request: &AccessRequest) -> Result<Decision> {
        self.validator.evaluate(request).await
    }

    pub async fn evaluate_with_deadline(
        &self,
        request: &AccessRequest,
        deadline: Instant,
    ) -> Result<Decision> {
        self.validator
            .evaluate_with_deadline(request, Some(deadline))
            .await
    }

    pub async fn package(
        &self,
        request: &AccessRequest,
        decision: &Decision,
    ) -> Result<PackageIssue> {
        self.packaging.package(request, decision).await
    }

    pub async fn package_with_deadline(
        &self,
        request: &AccessRequest,
        decision: &Decision,
        deadline: Instant,
    ) -> Result<PackageIssue> {
        self.packaging
            .package_with_deadline(request, decision, Some(deadline))
            .await
    }

    pub async fn redeem(&self, package_id: PackageId, token: &str) -> Result<ReleasedPayload> {
        self.packaging.redeem(package_id, token).await
    }

    // Audit

    pub async fn verify_chain(&self, from: u64, to: u64) -> Result<ChainVerification> {
        self.audit.verify_chain(from, to).await
    }

    pub async fn audit_entries(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>> {
        self.audit.read_range(from, to).await
    }

    /// Lift the integrity alarm after an operator has investigated.
    pub async fn clear_integrity_alarm(&self, actor: &Actor) {
        let first_broken = self.audit.alarm().first_broken().await;
        self.audit.alarm().clear().await;
        info!(%actor, ?first_broken, "operator cleared integrity alarm");
    }

    // Trust

    pub async fn onboard_buyer(
        &self,
        buyer_id: &BuyerId,
        actor: Actor,
    ) -> Result<Arc<TrustProfile>> {
        self.trust.onboard_buyer(buyer_id, actor).await
    }

    pub async fn trust_profile(&self, buyer_id: &BuyerId) -> Result<Arc<TrustProfile>> {
        self.trust.current(buyer_id).await
    }

    pub async fn trust_history(&self, buyer_id: &BuyerId) -> Vec<Arc<TrustProfile>> {
        self.trust.snapshots().history(buyer_id).await
    }

    pub async fn recompute_trust(&self, buyer_id: &BuyerId) -> Result<Arc<TrustProfile>> {
        self.trust.recompute(buyer_id).await
    }

    pub async fn rebuild_trust_profiles(&self) -> Result<Vec<Arc<TrustProfile>>> {
        self.trust.rebuild_from_audit().await
    }

    /// Start the background recompute worker.
    pub fn spawn_trust_worker(&self) -> (JoinHandle<()>, mpsc::Sender<TrustWorkerMessage>) {
        spawn_trust_worker(
            self.config.worker.clone(),
            self.trust.clone(),
            self.audit.subscribe(),
        )
    }

    // Compliance signals

    /// Record a policy violation by a buyer and recompute its profile.
    #[instrument(skip(self, description, actor), fields(buyer_id = %buyer_id))]
    pub async fn record_policy_violation(
        &self,
        buyer_id: &BuyerId,
        description: impl Into<String>,
        actor: Actor,
    ) -> Result<Arc<TrustProfile>> {
        self.require_onboarded(buyer_id).await?;
        self.audit
            .append(
                actor,
                AuditPayload::PolicyViolation {
                    buyer_id: buyer_id.clone(),
                    description: description.into(),
                },
            )
            .await?;
        self.trust.recompute(buyer_id).await
    }

    /// Record how a buyer handled a data subject request.
    #[instrument(skip(self, actor), fields(buyer_id = %buyer_id))]
    pub async fn record_dsr_outcome(
        &self,
        buyer_id: &BuyerId,
        request_ref: &str,
        on_time: bool,
        latency_hours: u32,
        actor: Actor,
    ) -> Result<Arc<TrustProfile>> {
        self.require_onboarded(buyer_id).await?;
        self.audit
            .append(
                actor,
                AuditPayload::DsrFulfilled {
                    buyer_id: buyer_id.clone(),
                    request_ref: request_ref.to_string(),
                    on_time,
                    latency_hours,
                },
            )
            .await?;
        self.trust.recompute(buyer_id).await
    }

    /// Erase a released payload in response to a deletion request.
    ///
    /// The erasure is audited before the payload is removed; the package
    /// record stays, and redeeming it afterwards fails with
    /// `PackageNotFound`.
    #[instrument(skip(self, actor), fields(package_id = %package_id))]
    pub async fn record_package_erasure(
        &self,
        package_id: PackageId,
        actor: Actor,
    ) -> Result<AuditEntry> {
        let package = self
            .storage
            .get_package(&package_id)
            .await?
            .ok_or(LedgerError::PackageNotFound(package_id))?;

        let entry = self
            .audit
            .append(
                actor,
                AuditPayload::PackageErased {
                    package_id,
                    grant_id: package.grant_id,
                    buyer_id: package.buyer_id,
                },
            )
            .await?;

        let removed = self.vault.remove(&package.payload.payload_ref).await?;
        info!(removed, sequence = entry.sequence, "package payload erased");
        Ok(entry)
    }

    pub async fn metrics_snapshot(&self) -> serde_json::Value {
        self.metrics.to_json().await
    }

    async fn require_onboarded(&self, buyer_id: &BuyerId) -> Result<()> {
        self.trust.current(buyer_id).await.map(|_| ())
    }
}
