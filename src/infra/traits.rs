//! Trait definitions for consent ledger persistence and collaborators

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::domain::{
    AuditEntry, BuyerId, ChainHead, ConsentGrant, DataCategory, DataPackage, GrantId,
    GrantRevocation, PackageId, ReleasedPayload, TrustProfile, UserId,
};

use super::Result;

/// State change committed together with its audit entry
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerMutation {
    /// Audit-only entry (decisions, onboarding, compliance signals)
    None,
    Grant(ConsentGrant),
    Revocation(GrantRevocation),
    Package(DataPackage),
}

/// Authoritative storage for grants, packages and the audit chain.
///
/// Invariant: no state change is visible without its audit entry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Atomically append `entry` and apply `mutation`.
    ///
    /// Compare-and-append: fails with `SequenceConflict` unless
    /// `entry.sequence == head + 1` and `entry.prev_hash == head.hash`.
    /// Fails with `AlreadyRevoked` if a revocation targets a revoked grant.
    async fn commit(&self, entry: &AuditEntry, mutation: &LedgerMutation) -> Result<()>;

    /// Latest committed entry position
    async fn audit_head(&self) -> Result<ChainHead>;

    /// Read audit entries with `from <= sequence <= to`, ascending
    async fn read_audit_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>>;

    /// Newest `limit` entries attributable to a buyer, returned ascending
    async fn read_buyer_audit(
        &self,
        buyer_id: &BuyerId,
        up_to: Option<u64>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>>;

    /// Get a grant with its revocation folded in
    async fn get_grant(&self, grant_id: &GrantId) -> Result<Option<ConsentGrant>>;

    /// All grants (active or not) for a (user, buyer, category) tuple
    async fn grants_for(
        &self,
        user_id: &UserId,
        buyer_id: &BuyerId,
        category: &DataCategory,
    ) -> Result<Vec<ConsentGrant>>;

    async fn get_package(&self, package_id: &PackageId) -> Result<Option<DataPackage>>;

    /// Buyers with a `buyer_onboarded` entry
    async fn list_buyers(&self) -> Result<Vec<BuyerId>>;

    /// Persist a derived trust profile
    async fn store_trust_profile(&self, profile: &TrustProfile) -> Result<()>;

    /// Newest stored profile per buyer
    async fn latest_trust_profiles(&self) -> Result<Vec<TrustProfile>>;
}

/// Storage for released payloads, addressed by opaque reference
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PayloadVault: Send + Sync {
    async fn put(&self, payload_ref: &str, payload: &ReleasedPayload) -> Result<()>;

    async fn get(&self, payload_ref: &str) -> Result<Option<ReleasedPayload>>;

    /// Returns whether a payload was removed
    async fn remove(&self, payload_ref: &str) -> Result<bool>;
}

/// Raw user data, owned by an external collaborator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch the requested fields of one user's data in a category.
    /// Missing fields are simply absent from the result.
    async fn fetch(
        &self,
        user_id: &UserId,
        category: &DataCategory,
        fields: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, serde_json::Value>>;
}
