//! Consent grants and revocations

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Actor, AnonymizationLevel, BuyerId, DataCategory, GrantId, UserId};
use crate::infra::{LedgerError, Result};

/// One user's permission for one (buyer, category, purpose) tuple.
///
/// Revocation is never an in-place edit of a stored grant; `revoked_at` is
/// folded in from the terminal revocation record when a grant is read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentGrant {
    pub grant_id: GrantId,
    pub user_id: UserId,
    pub buyer_id: BuyerId,
    pub category: DataCategory,
    pub purpose: String,
    /// Specific data points within the category
    pub scope: BTreeSet<String>,
    /// Anonymization level the user asked for
    pub requested_level: AnonymizationLevel,
    pub granted_at: DateTime<Utc>,
    /// `None` means no expiry
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Consent policy version the user agreed to
    pub policy_version: String,
    /// How consent was captured; kept for audit only
    #[serde(default)]
    pub consent_method: serde_json::Value,
}

impl ConsentGrant {
    /// Active means not revoked and `granted_at <= now < expires_at`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() || now < self.granted_at {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Granted data points that were also requested
    pub fn scope_intersection(&self, requested: &BTreeSet<String>) -> BTreeSet<String> {
        self.scope.intersection(requested).cloned().collect()
    }
}

/// Grant as submitted by a user, before the ledger assigns id and timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGrant {
    pub user_id: UserId,
    pub buyer_id: BuyerId,
    pub category: DataCategory,
    pub purpose: String,
    pub scope: BTreeSet<String>,
    pub requested_level: AnonymizationLevel,
    pub expires_at: Option<DateTime<Utc>>,
    pub policy_version: String,
    #[serde(default)]
    pub consent_method: serde_json::Value,
}

impl NewGrant {
    pub fn new(
        user_id: UserId,
        buyer_id: BuyerId,
        category: DataCategory,
        purpose: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            buyer_id,
            category,
            purpose: purpose.into(),
            scope: BTreeSet::new(),
            requested_level: AnonymizationLevel::Full,
            expires_at: None,
            policy_version: "1".to_string(),
            consent_method: serde_json::Value::Null,
        }
    }

    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_level(mut self, level: AnonymizationLevel) -> Self {
        self.requested_level = level;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_policy_version(mut self, version: impl Into<String>) -> Self {
        self.policy_version = version.into();
        self
    }

    pub fn with_consent_method(mut self, method: serde_json::Value) -> Self {
        self.consent_method = method;
        self
    }

    /// Check well-formedness against the issuance time.
    pub fn validate(&self, granted_at: DateTime<Utc>) -> Result<()> {
        if self.user_id.0.trim().is_empty() {
            return Err(LedgerError::InvalidGrant("user id is empty".into()));
        }
        if self.buyer_id.0.trim().is_empty() {
            return Err(LedgerError::InvalidGrant("buyer id is empty".into()));
        }
        if self.category.0.trim().is_empty() {
            return Err(LedgerError::InvalidGrant("category is empty".into()));
        }
        if self.purpose.trim().is_empty() {
            return Err(LedgerError::InvalidGrant("purpose is empty".into()));
        }
        if self.scope.is_empty() || self.scope.iter().any(|s| s.trim().is_empty()) {
            return Err(LedgerError::InvalidGrant(
                "scope must name at least one data point".into(),
            ));
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= granted_at {
                return Err(LedgerError::InvalidGrant(format!(
                    "expiry {expires_at} does not follow issuance {granted_at}"
                )));
            }
        }
        Ok(())
    }

    pub fn into_grant(self, grant_id: GrantId, granted_at: DateTime<Utc>) -> ConsentGrant {
        ConsentGrant {
            grant_id,
            user_id: self.user_id,
            buyer_id: self.buyer_id,
            category: self.category,
            purpose: self.purpose,
            scope: self.scope,
            requested_level: self.requested_level,
            granted_at,
            expires_at: self.expires_at,
            revoked_at: None,
            policy_version: self.policy_version,
            consent_method: self.consent_method,
        }
    }
}

/// Why a grant was revoked.
///
/// Only `BuyerConduct` is attributable to the buyer for trust scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RevocationReason {
    UserRequest,
    BuyerConduct(String),
    Administrative(String),
}

impl RevocationReason {
    pub fn attributable_to_buyer(&self) -> bool {
        matches!(self, RevocationReason::BuyerConduct(_))
    }
}

/// Terminal revocation record for a grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRevocation {
    pub grant_id: GrantId,
    pub revoked_at: DateTime<Utc>,
    pub actor: Actor,
    pub reason: RevocationReason,
}
