//! Released data packages, access tokens and delivery receipts

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    hash256_hex, AnonymizationLevel, BuyerId, GrantId, Hash256, PackageId, RequestId, UserId,
};

/// Opaque reference to a stored payload plus its digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    /// Vault key for the released payload
    pub payload_ref: String,
    /// SHA-256 over the canonical payload
    #[serde(with = "hash256_hex")]
    pub digest: Hash256,
    pub field_count: u32,
}

/// Record of one successful release.
///
/// Never references a grant that was inactive at `issued_at`, and
/// `applied_level` is never weaker than the grant level or tier floor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPackage {
    pub package_id: PackageId,
    pub request_id: RequestId,
    pub grant_id: GrantId,
    pub buyer_id: BuyerId,
    pub user_id: UserId,
    pub applied_level: AnonymizationLevel,
    pub payload: PayloadDescriptor,
    pub issued_at: DateTime<Utc>,
    pub token_expires_at: DateTime<Utc>,
    /// Hex SHA-256 of the access token; the token itself is never stored
    pub token_hash: String,
}

impl DataPackage {
    pub fn token_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.token_expires_at
    }
}

/// Bearer token for downloading a package. Only its hash is persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(pub String);

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Receipt handed to the buyer alongside the token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub package_id: PackageId,
    pub request_id: RequestId,
    pub buyer_id: BuyerId,
    pub applied_level: AnonymizationLevel,
    #[serde(with = "hash256_hex")]
    pub payload_digest: Hash256,
    pub field_count: u32,
    pub issued_at: DateTime<Utc>,
    pub token_expires_at: DateTime<Utc>,
    pub audit_sequence: u64,
}

/// Result of a successful packaging run
#[derive(Debug, Clone)]
pub struct PackageIssue {
    pub package: DataPackage,
    pub access_token: AccessToken,
    pub receipt: DeliveryReceipt,
}

/// Transformed payload as stored in the vault and served to the buyer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasedPayload {
    /// Per-package pseudonym, or the user id when released at level `none`
    pub subject: String,
    pub category: String,
    pub level: AnonymizationLevel,
    pub fields: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_token_debug_is_redacted() {
        let token = AccessToken("secret-token".into());
        assert!(!format!("{token:?}").contains("secret"));
    }
}
