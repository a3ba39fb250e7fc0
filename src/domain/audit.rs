//! Audit trail entries and chain verification results

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    hash256_hex, Actor, AnonymizationLevel, BuyerId, ConsentGrant, DataCategory, DecisionOutcome,
    DenialReason, GrantId, Hash256, PackageId, RequestId, RevocationReason, TrustTier, UserId,
};

/// Kind of audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    GrantRecorded,
    GrantRevoked,
    AccessGranted,
    AccessDenied,
    PackageIssued,
    BuyerOnboarded,
    PolicyViolation,
    DsrFulfilled,
    PackageErased,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::GrantRecorded => "grant_recorded",
            AuditAction::GrantRevoked => "grant_revoked",
            AuditAction::AccessGranted => "access_granted",
            AuditAction::AccessDenied => "access_denied",
            AuditAction::PackageIssued => "package_issued",
            AuditAction::BuyerOnboarded => "buyer_onboarded",
            AuditAction::PolicyViolation => "policy_violation",
            AuditAction::DsrFulfilled => "dsr_fulfilled",
            AuditAction::PackageErased => "package_erased",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "grant_recorded" => AuditAction::GrantRecorded,
            "grant_revoked" => AuditAction::GrantRevoked,
            "access_granted" => AuditAction::AccessGranted,
            "access_denied" => AuditAction::AccessDenied,
            "package_issued" => AuditAction::PackageIssued,
            "buyer_onboarded" => AuditAction::BuyerOnboarded,
            "policy_violation" => AuditAction::PolicyViolation,
            "dsr_fulfilled" => AuditAction::DsrFulfilled,
            "package_erased" => AuditAction::PackageErased,
            _ => return None,
        })
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed body of an audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditPayload {
    GrantRecorded {
        grant: ConsentGrant,
    },
    GrantRevoked {
        grant_id: GrantId,
        user_id: UserId,
        buyer_id: BuyerId,
        category: DataCategory,
        reason: RevocationReason,
        revoked_at: DateTime<Utc>,
    },
    /// ALLOW or RESTRICT
    AccessGranted {
        request_id: RequestId,
        grant_id: GrantId,
        user_id: UserId,
        buyer_id: BuyerId,
        category: DataCategory,
        purpose: String,
        outcome: DecisionOutcome,
        effective_level: AnonymizationLevel,
        trust_tier: TrustTier,
    },
    AccessDenied {
        request_id: RequestId,
        grant_id: Option<GrantId>,
        user_id: UserId,
        buyer_id: BuyerId,
        category: DataCategory,
        purpose: String,
        reason: DenialReason,
        trust_tier: TrustTier,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    PackageIssued {
        package_id: PackageId,
        request_id: RequestId,
        grant_id: GrantId,
        user_id: UserId,
        buyer_id: BuyerId,
        applied_level: AnonymizationLevel,
        #[serde(with = "hash256_hex")]
        payload_digest: Hash256,
        token_expires_at: DateTime<Utc>,
    },
    BuyerOnboarded {
        buyer_id: BuyerId,
    },
    PolicyViolation {
        buyer_id: BuyerId,
        description: String,
    },
    DsrFulfilled {
        buyer_id: BuyerId,
        request_ref: String,
        on_time: bool,
        latency_hours: u32,
    },
    PackageErased {
        package_id: PackageId,
        grant_id: GrantId,
        buyer_id: BuyerId,
    },
}

impl AuditPayload {
    pub fn action(&self) -> AuditAction {
        match self {
            AuditPayload::GrantRecorded { .. } => AuditAction::GrantRecorded,
            AuditPayload::GrantRevoked { .. } => AuditAction::GrantRevoked,
            AuditPayload::AccessGranted { .. } => AuditAction::AccessGranted,
            AuditPayload::AccessDenied { .. } => AuditAction::AccessDenied,
            AuditPayload::PackageIssued { .. } => AuditAction::PackageIssued,
            AuditPayload::BuyerOnboarded { .. } => AuditAction::BuyerOnboarded,
            AuditPayload::PolicyViolation { .. } => AuditAction::PolicyViolation,
            AuditPayload::DsrFulfilled { .. } => AuditAction::DsrFulfilled,
            AuditPayload::PackageErased { .. } => AuditAction::PackageErased,
        }
    }

    /// Buyer this entry is attributable to, if any
    pub fn buyer_id(&self) -> Option<&BuyerId> {
        match self {
            AuditPayload::GrantRecorded { grant } => Some(&grant.buyer_id),
            AuditPayload::GrantRevoked { buyer_id, .. }
            | AuditPayload::AccessGranted { buyer_id, .. }
            | AuditPayload::AccessDenied { buyer_id, .. }
            | AuditPayload::PackageIssued { buyer_id, .. }
            | AuditPayload::BuyerOnboarded { buyer_id }
            | AuditPayload::PolicyViolation { buyer_id, .. }
            | AuditPayload::DsrFulfilled { buyer_id, .. }
            | AuditPayload::PackageErased { buyer_id, .. } => Some(buyer_id),
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            AuditPayload::GrantRecorded { grant } => Some(&grant.user_id),
            AuditPayload::GrantRevoked { user_id, .. }
            | AuditPayload::AccessGranted { user_id, .. }
            | AuditPayload::AccessDenied { user_id, .. }
            | AuditPayload::PackageIssued { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    pub fn grant_id(&self) -> Option<GrantId> {
        match self {
            AuditPayload::GrantRecorded { grant } => Some(grant.grant_id),
            AuditPayload::GrantRevoked { grant_id, .. }
            | AuditPayload::AccessGranted { grant_id, .. }
            | AuditPayload::PackageIssued { grant_id, .. }
            | AuditPayload::PackageErased { grant_id, .. } => Some(*grant_id),
            AuditPayload::AccessDenied { grant_id, .. } => *grant_id,
            _ => None,
        }
    }
}

/// One immutable, hash-chained audit record.
///
/// `entry_hash` covers the sequence, `prev_hash`, actor, action, timestamp
/// and canonical payload; see [`crate::crypto::compute_entry_hash`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    #[serde(with = "hash256_hex")]
    pub prev_hash: Hash256,
    #[serde(with = "hash256_hex")]
    pub entry_hash: Hash256,
    pub actor: Actor,
    pub action: AuditAction,
    /// Microsecond precision so stored timestamps hash identically on reload
    pub recorded_at: DateTime<Utc>,
    pub payload: AuditPayload,
}

impl AuditEntry {
    pub fn buyer_id(&self) -> Option<&BuyerId> {
        self.payload.buyer_id()
    }

    pub fn grant_id(&self) -> Option<GrantId> {
        self.payload.grant_id()
    }
}

/// Latest committed position of the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub sequence: u64,
    #[serde(with = "hash256_hex")]
    pub hash: Hash256,
}

impl ChainHead {
    /// Head of an empty chain. The first entry gets sequence 1.
    pub fn genesis() -> Self {
        Self {
            sequence: 0,
            hash: [0u8; 32],
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence == 0
    }
}

/// Why chain verification stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainFault {
    /// Recomputed hash differs from the stored one
    HashMismatch,
    /// `prev_hash` does not equal the preceding entry's hash
    BrokenLink,
    /// Expected sequence number missing or out of order
    SequenceGap { expected: u64, found: u64 },
    /// Entry missing at the end of the requested range
    Missing { expected: u64 },
}

/// Outcome of `verify_chain`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub entries_checked: u64,
    pub intact: bool,
    /// First offending sequence number
    pub first_broken: Option<u64>,
    pub fault: Option<ChainFault>,
}
