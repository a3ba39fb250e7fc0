//! In-memory implementations of the persistence traits
//!
//! All state sits behind a single tokio `RwLock`; a commit validates and
//! applies its entry and mutation inside one write section, so readers see
//! either both or neither.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DataSource, LedgerError, LedgerMutation, LedgerStorage, PayloadVault, Result};
use crate::domain::{
    AuditAction, AuditEntry, BuyerId, ChainHead, ConsentGrant, DataCategory, DataPackage,
    GrantId, GrantRevocation, PackageId, ReleasedPayload, TrustProfile, UserId,
};

type GrantTuple = (UserId, BuyerId, DataCategory);

#[derive(Default)]
struct MemoryState {
    /// Index `i` holds sequence `i + 1`
    audit: Vec<AuditEntry>,
    grants: HashMap<GrantId, ConsentGrant>,
    revocations: HashMap<GrantId, GrantRevocation>,
    grants_by_tuple: HashMap<GrantTuple, Vec<GrantId>>,
    packages: HashMap<PackageId, DataPackage>,
    buyers: BTreeSet<BuyerId>,
    trust_profiles: HashMap<BuyerId, TrustProfile>,
}

impl MemoryState {
    fn head(&self) -> ChainHead {
        self.audit
            .last()
            .map(|e| ChainHead {
                sequence: e.sequence,
                hash: e.entry_hash,
            })
            .unwrap_or_else(ChainHead::genesis)
    }

    fn folded(&self, grant: &ConsentGrant) -> ConsentGrant {
        let mut grant = grant.clone();
        grant.revoked_at = self
            .revocations
            .get(&grant.grant_id)
            .map(|r| r.revoked_at);
        grant
    }
}

/// Process-local ledger storage
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStorage for MemoryStorage {
    async fn commit(&self, entry: &AuditEntry, mutation: &LedgerMutation) -> Result<()> {
        let mut state = self.state.write().await;

        let head = state.head();
        if entry.sequence != head.sequence + 1 || entry.prev_hash != head.hash {
            return Err(LedgerError::SequenceConflict {
                expected: head.sequence + 1,
                actual: entry.sequence,
            });
        }

        match mutation {
            LedgerMutation::None => {}
            LedgerMutation::Grant(grant) => {
                if state.grants.contains_key(&grant.grant_id) {
                    return Err(LedgerError::InvalidGrant(format!(
                        "duplicate grant id {}",
                        grant.grant_id
                    )));
                }
            }
            LedgerMutation::Revocation(revocation) => {
                if !state.grants.contains_key(&revocation.grant_id) {
                    return Err(LedgerError::GrantNotFound(revocation.grant_id));
                }
                if state.revocations.contains_key(&revocation.grant_id) {
                    return Err(LedgerError::AlreadyRevoked(revocation.grant_id));
                }
            }
            LedgerMutation::Package(package) => {
                if !state.grants.contains_key(&package.grant_id) {
                    return Err(LedgerError::GrantNotFound(package.grant_id));
                }
            }
        }

        // Validated; apply both halves.
        match mutation {
            LedgerMutation::None => {}
            LedgerMutation::Grant(grant) => {
                let tuple = (
                    grant.user_id.clone(),
                    grant.buyer_id.clone(),
                    grant.category.clone(),
                );
                state
                    .grants_by_tuple
                    .entry(tuple)
                    .or_default()
                    .push(grant.grant_id);
                let mut stored = grant.clone();
                stored.revoked_at = None;
                state.grants.insert(grant.grant_id, stored);
            }
            LedgerMutation::Revocation(revocation) => {
                state
                    .revocations
                    .insert(revocation.grant_id, revocation.clone());
            }
            LedgerMutation::Package(package) => {
                state.packages.insert(package.package_id, package.clone());
            }
        }
        if entry.action == AuditAction::BuyerOnboarded {
            if let Some(buyer_id) = entry.buyer_id() {
                state.buyers.insert(buyer_id.clone());
            }
        }
        state.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_head(&self) -> Result<ChainHead> {
        Ok(self.state.read().await.head())
    }

    async fn read_audit_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().await;
        let from = from.max(1);
        if to < from {
            return Ok(Vec::new());
        }
        let start = (from - 1) as usize;
        let end = (to as usize).min(state.audit.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(state.audit[start..end].to_vec())
    }

    async fn read_buyer_audit(
        &self,
        buyer_id: &BuyerId,
        up_to: Option<u64>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().await;
        let up_to = up_to.unwrap_or(u64::MAX);
        let mut entries: Vec<AuditEntry> = state
            .audit
            .iter()
            .rev()
            .filter(|e| e.sequence <= up_to && e.buyer_id() == Some(buyer_id))
            .take(limit)
            .cloned()
            .collect();
        entries.reverse();
        Ok(entries)
    }

    async fn get_grant(&self, grant_id: &GrantId) -> Result<Option<ConsentGrant>> {
        let state = self.state.read().await;
        Ok(state.grants.get(grant_id).map(|g| state.folded(g)))
    }

    async fn grants_for(
        &self,
        user_id: &UserId,
        buyer_id: &BuyerId,
        category: &DataCategory,
    ) -> Result<Vec<ConsentGrant>> {
        let state = self.state.read().await;
        let tuple = (user_id.clone(), buyer_id.clone(), category.clone());
        Ok(state
            .grants_by_tuple
            .get(&tuple)
            .into_iter()
            .flatten()
            .filter_map(|id| state.grants.get(id))
            .map(|g| state.folded(g))
            .collect())
    }

    async fn get_package(&self, package_id: &PackageId) -> Result<Option<DataPackage>> {
        Ok(self.state.read().await.packages.get(package_id).cloned())
    }

    async fn list_buyers(&self) -> Result<Vec<BuyerId>> {
        Ok(self.state.read().await.buyers.iter().cloned().collect())
    }

    async fn store_trust_profile(&self, profile: &TrustProfile) -> Result<()> {
        let mut state = self.state.write().await;
        let newer = state
            .trust_profiles
            .get(&profile.buyer_id)
            .map_or(true, |p| p.as_of_sequence <= profile.as_of_sequence);
        if newer {
            state
                .trust_profiles
                .insert(profile.buyer_id.clone(), profile.clone());
        }
        Ok(())
    }

    async fn latest_trust_profiles(&self) -> Result<Vec<TrustProfile>> {
        Ok(self
            .state
            .read()
            .await
            .trust_profiles
            .values()
            .cloned()
            .collect())
    }
}

/// Process-local payload vault
#[derive(Default)]
pub struct MemoryPayloadVault {
    payloads: RwLock<HashMap<String, ReleasedPayload>>,
}

impl MemoryPayloadVault {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.payloads.read().await.len()
    }
}

#[async_trait]
impl PayloadVault for MemoryPayloadVault {
    async fn put(&self, payload_ref: &str, payload: &ReleasedPayload) -> Result<()> {
        self.payloads
            .write()
            .await
            .insert(payload_ref.to_string(), payload.clone());
        Ok(())
    }

    async fn get(&self, payload_ref: &str) -> Result<Option<ReleasedPayload>> {
        Ok(self.payloads.read().await.get(payload_ref).cloned())
    }

    async fn remove(&self, payload_ref: &str) -> Result<bool> {
        Ok(self.payloads.write().await.remove(payload_ref).is_some())
    }
}

/// Raw user data held in memory, keyed by (user, category)
#[derive(Default)]
pub struct MemoryDataSource {
    records: RwLock<HashMap<(UserId, DataCategory), BTreeMap<String, serde_json::Value>>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace one user's record for a category
    pub async fn insert(
        &self,
        user_id: UserId,
        category: DataCategory,
        record: BTreeMap<String, serde_json::Value>,
    ) {
        self.records
            .write()
            .await
            .insert((user_id, category), record);
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn fetch(
        &self,
        user_id: &UserId,
        category: &DataCategory,
        fields: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, serde_json::Value>> {
        let records = self.records.read().await;
        let Some(record) = records.get(&(user_id.clone(), category.clone())) else {
            return Ok(BTreeMap::new());
        };
        Ok(record
            .iter()
            .filter(|(k, _)| fields.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
