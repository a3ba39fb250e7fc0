//! Access requests and validator decisions

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AnonymizationLevel, BuyerId, DataCategory, GrantId, RequestId, TrustTier, UserId};
use crate::infra::{LedgerError, Result};

/// A buyer's request for one user's data in one category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub request_id: RequestId,
    pub buyer_id: BuyerId,
    pub user_id: UserId,
    pub category: DataCategory,
    pub purpose: String,
    /// Data points the buyer wants
    pub scope: BTreeSet<String>,
}

impl AccessRequest {
    pub fn new(
        buyer_id: BuyerId,
        user_id: UserId,
        category: DataCategory,
        purpose: impl Into<String>,
    ) -> Self {
        Self {
            request_id: RequestId::new(),
            buyer_id,
            user_id,
            category,
            purpose: purpose.into(),
            scope: BTreeSet::new(),
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

    /// Boundary well-formedness check
    pub fn validate(&self) -> Result<()> {
        let missing = [
            ("buyer id", self.buyer_id.0.as_str()),
            ("user id", self.user_id.0.as_str()),
            ("category", self.category.0.as_str()),
            ("purpose", self.purpose.as_str()),
        ]
        .into_iter()
        .find(|(_, v)| v.trim().is_empty());

        if let Some((field, _)) = missing {
            return Err(LedgerError::InvalidRequest(format!("{field} is empty")));
        }
        if self.scope.is_empty() {
            return Err(LedgerError::InvalidRequest(
                "request must name at least one data point".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Allow,
    Deny,
    /// Allowed, but at a level stricter than the grant asked for
    Restrict,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Allow => "allow",
            DecisionOutcome::Deny => "deny",
            DecisionOutcome::Restrict => "restrict",
        }
    }
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable denial reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoConsent,
    PurposeMismatch,
    TrustFloorNotMet,
    ScopeNotGranted,
    StateChanged,
    PackagingFailed,
    ServiceHalted,
}

impl DenialReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::NoConsent => "no_consent",
            DenialReason::PurposeMismatch => "purpose_mismatch",
            DenialReason::TrustFloorNotMet => "trust_floor_not_met",
            DenialReason::ScopeNotGranted => "scope_not_granted",
            DenialReason::StateChanged => "state_changed",
            DenialReason::PackagingFailed => "packaging_failed",
            DenialReason::ServiceHalted => "service_halted",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Validator output. Every decision is backed by an audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub request_id: RequestId,
    pub outcome: DecisionOutcome,
    pub reason: Option<DenialReason>,
    /// Set on ALLOW and RESTRICT
    pub effective_level: Option<AnonymizationLevel>,
    pub grant_id: Option<GrantId>,
    /// Level recorded on the authoritative grant
    pub grant_level: Option<AnonymizationLevel>,
    pub trust_tier: TrustTier,
    /// Requested data points the grant covers
    pub granted_scope: BTreeSet<String>,
    pub audit_sequence: u64,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn is_permitted(&self) -> bool {
        matches!(
            self.outcome,
            DecisionOutcome::Allow | DecisionOutcome::Restrict
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AccessRequest {
        AccessRequest::new(
            BuyerId::new("buyer-1"),
            UserId::new("user-1"),
            DataCategory::new("location"),
            "research",
        )
        .with_scope(["lat"])
    }

    #[test]
    fn test_validate_request() {
        assert!(request().validate().is_ok());

        let mut bad = request();
        bad.purpose = String::new();
        match bad.validate() {
            Err(LedgerError::InvalidRequest(msg)) => assert!(msg.contains("purpose")),
            other => panic!("expected InvalidRequest, got {other:?}"),
        }

        let mut bad = request();
        bad.scope.clear();
        assert!(matches!(bad.validate(), Err(LedgerError::InvalidRequest(_))));
    }

    #[test]
    fn test_denial_codes() {
        assert_eq!(DenialReason::NoConsent.code(), "no_consent");
        assert_eq!(DenialReason::TrustFloorNotMet.to_string(), "trust_floor_not_met");
        assert_eq!(
            serde_json::to_string(&DenialReason::PurposeMismatch).unwrap(),
            "\"purpose_mismatch\""
        );
    }
}
