use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::scoring::score_history;
use super::snapshot::TrustSnapshots;
use crate::audit::AuditTrail;
use crate::config::ScoringConfig;
use crate::domain::{Actor, AuditPayload, BuyerId, TrustProfile};
use crate::infra::{LedgerError, LedgerStorage, Result};
use crate::metrics::{metric_names, MetricsRegistry};

/// Derives buyer trust profiles from the audit trail.
///
/// Profiles are derived state: the audit log is authoritative and
/// [`TrustEngine::rebuild_from_audit`] reconstructs every profile from it.
pub struct TrustEngine {
    storage: Arc<dyn LedgerStorage>,
    audit: Arc<AuditTrail>,
    snapshots: TrustSnapshots,
    config: ScoringConfig,
    metrics: Arc<MetricsRegistry>,
    onboarding: Mutex<()>,
}

impl TrustEngine {
    pub fn new(
        storage: Arc<dyn LedgerStorage>,
        audit: Arc<AuditTrail>,
        config: ScoringConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            storage,
            audit,
            snapshots: TrustSnapshots::new(config.history_depth),
            config,
            metrics,
            onboarding: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &TrustSnapshots {
        &self.snapshots
    }

    /// Register a buyer and publish its baseline profile.
    ///
    /// Onboarding an existing buyer returns its current profile without
    /// appending anything.
    #[instrument(skip(self, actor), fields(buyer_id = %buyer_id))]
    pub async fn onboard_buyer(
        &self,
        buyer_id: &BuyerId,
        actor: Actor,
    ) -> Result<Arc<TrustProfile>> {
        if buyer_id.as_str().trim().is_empty() {
            return Err(LedgerError::InvalidRequest("buyer id is empty".into()));
        }

        let _guard = self.onboarding.lock().await;
        if self.is_onboarded(buyer_id).await? {
            debug!("buyer already onboarded");
            return self.current(buyer_id).await;
        }

        let entry = self
            .audit
            .append(
                actor,
                AuditPayload::BuyerOnboarded {
                    buyer_id: buyer_id.clone(),
                },
            )
            .await?;
        info!(sequence = entry.sequence, "buyer onboarded");
        self.recompute(buyer_id).await
    }

    /// Current profile, recomputing on a cold arena.
    pub async fn current(&self, buyer_id: &BuyerId) -> Result<Arc<TrustProfile>> {
        if let Some(profile) = self.snapshots.current(buyer_id).await {
            return Ok(profile);
        }
        self.recompute(buyer_id).await
    }

    /// Recompute one buyer over its most recent audit window.
    ///
    /// Idempotent: unchanged history yields an identical profile and no new
    /// version in the arena.
    #[instrument(skip(self), fields(buyer_id = %buyer_id))]
    pub async fn recompute(&self, buyer_id: &BuyerId) -> Result<Arc<TrustProfile>> {
        let window = self
            .audit
            .entries_for_buyer(buyer_id, None, self.config.window_size)
            .await?;

        if self.snapshots.current(buyer_id).await.is_none()
            && !self.is_onboarded(buyer_id).await?
        {
            return Err(LedgerError::BuyerNotFound(buyer_id.to_string()));
        }

        let profile = score_history(buyer_id, &window, &self.config)
            .ok_or_else(|| LedgerError::BuyerNotFound(buyer_id.to_string()))?;

        self.storage.store_trust_profile(&profile).await?;
        let published = self.snapshots.publish(profile).await;

        self.metrics
            .inc_counter(metric_names::TRUST_RECOMPUTES)
            .await;
        debug!(
            score = published.score,
            tier = %published.tier,
            as_of = published.as_of_sequence,
            "trust recomputed"
        );
        Ok(published)
    }

    /// Recompute every onboarded buyer. Failures are logged and skipped.
    pub async fn recompute_all(&self) -> Result<Vec<Arc<TrustProfile>>> {
        let buyers = self.storage.list_buyers().await?;
        let mut profiles = Vec::with_capacity(buyers.len());
        for buyer_id in &buyers {
            match self.recompute(buyer_id).await {
                Ok(profile) => profiles.push(profile),
                Err(e) => warn!(buyer_id = %buyer_id, error = %e, "trust recompute failed"),
            }
        }
        self.metrics
            .set_gauge(metric_names::TRUST_BUYERS, buyers.len() as u64)
            .await;
        Ok(profiles)
    }

    /// Discard every derived profile and rebuild from the audit log alone.
    #[instrument(skip(self))]
    pub async fn rebuild_from_audit(&self) -> Result<Vec<Arc<TrustProfile>>> {
        self.snapshots.clear().await;
        let mut profiles = Vec::new();
        for buyer_id in self.storage.list_buyers().await? {
            profiles.push(self.recompute(&buyer_id).await?);
        }
        info!(buyers = profiles.len(), "trust profiles rebuilt from audit log");
        Ok(profiles)
    }

    /// Seed the arena from persisted profiles, then bring every buyer up to
    /// date with the log.
    pub async fn warm_start(&self) -> Result<usize> {
        let stored = self.storage.latest_trust_profiles().await?;
        let loaded = stored.len();
        for profile in stored {
            self.snapshots.publish(profile).await;
        }
        let profiles = self.recompute_all().await?;
        debug!(loaded, buyers = profiles.len(), "trust arena warmed");
        Ok(profiles.len())
    }

    async fn is_onboarded(&self, buyer_id: &BuyerId) -> Result<bool> {
        Ok(self.storage.list_buyers().await?.contains(buyer_id))
    }
}
