//! Core type definitions for the consent ledger
//!
//! Identifiers, the anonymization-level and trust-tier orders, and actor
//! identity. Levels and tiers are ordered enums; comparisons never go through
//! their string forms.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::infra::LedgerError;

/// 32-byte hash (SHA-256)
pub type Hash256 = [u8; 32];

/// External user identifier (lookup only; the identity service owns the record)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External buyer identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuyerId(pub String);

impl BuyerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuyerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of personal data a grant covers (e.g. "location", "health")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataCategory(pub String);

impl DataCategory {
    pub fn new(category: impl Into<String>) -> Self {
        Self(category.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consent grant identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantId(pub uuid::Uuid);

impl GrantId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for GrantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Released data package identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(pub uuid::Uuid);

impl PackageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for PackageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access request identifier, assigned by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Degree of identity removal applied to released data.
///
/// Totally ordered: `None < Minimal < Partial < Full`. A greater level is
/// stricter; combining two requirements always takes the stricter one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AnonymizationLevel {
    /// Identified data
    None,
    /// Direct identifiers removed
    Minimal,
    /// Direct identifiers and sensitive fields removed, quasi-identifiers generalized
    Partial,
    /// Only non-identifying attributes remain
    #[default]
    Full,
}

impl AnonymizationLevel {
    pub const ALL: [AnonymizationLevel; 4] = [
        AnonymizationLevel::None,
        AnonymizationLevel::Minimal,
        AnonymizationLevel::Partial,
        AnonymizationLevel::Full,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymizationLevel::None => "none",
            AnonymizationLevel::Minimal => "minimal",
            AnonymizationLevel::Partial => "partial",
            AnonymizationLevel::Full => "full",
        }
    }

    /// The stricter of two levels.
    pub fn stricter(self, other: AnonymizationLevel) -> AnonymizationLevel {
        self.max(other)
    }

    pub fn is_weaker_than(&self, other: &AnonymizationLevel) -> bool {
        self < other
    }
}

impl fmt::Display for AnonymizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnonymizationLevel {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AnonymizationLevel::None),
            "minimal" => Ok(AnonymizationLevel::Minimal),
            "partial" => Ok(AnonymizationLevel::Partial),
            "full" => Ok(AnonymizationLevel::Full),
            other => Err(LedgerError::Configuration(format!(
                "unknown anonymization level: {other}"
            ))),
        }
    }
}

/// Discrete buyer classification derived from the trust score.
///
/// Ordered from least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    Untrusted,
    Provisional,
    Standard,
    Trusted,
    Verified,
}

impl TrustTier {
    pub const ALL: [TrustTier; 5] = [
        TrustTier::Untrusted,
        TrustTier::Provisional,
        TrustTier::Standard,
        TrustTier::Trusted,
        TrustTier::Verified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustTier::Untrusted => "untrusted",
            TrustTier::Provisional => "provisional",
            TrustTier::Standard => "standard",
            TrustTier::Trusted => "trusted",
            TrustTier::Verified => "verified",
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustTier {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "untrusted" => Ok(TrustTier::Untrusted),
            "provisional" => Ok(TrustTier::Provisional),
            "standard" => Ok(TrustTier::Standard),
            "trusted" => Ok(TrustTier::Trusted),
            "verified" => Ok(TrustTier::Verified),
            other => Err(LedgerError::Configuration(format!(
                "unknown trust tier: {other}"
            ))),
        }
    }
}

/// Who performed an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    Buyer,
    System,
    Admin,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::User => "user",
            ActorKind::Buyer => "buyer",
            ActorKind::System => "system",
            ActorKind::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ActorKind::User),
            "buyer" => Some(ActorKind::Buyer),
            "system" => Some(ActorKind::System),
            "admin" => Some(ActorKind::Admin),
            _ => None,
        }
    }
}

/// Authenticated actor identity, supplied by the caller's auth layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
}

impl Actor {
    pub fn user(id: &UserId) -> Self {
        Self {
            kind: ActorKind::User,
            id: id.0.clone(),
        }
    }

    pub fn buyer(id: &BuyerId) -> Self {
        Self {
            kind: ActorKind::Buyer,
            id: id.0.clone(),
        }
    }

    pub fn system(component: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::System,
            id: component.into(),
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Admin,
            id: id.into(),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Serde module for serializing Hash256 as hex strings
pub mod hash256_hex {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes for Hash256"))
    }
}

/// Parse a hex-encoded 32-byte hash
pub fn parse_hash256(s: &str) -> Option<Hash256> {
    hex::decode(s).ok()?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order_and_stricter() {
        assert!(AnonymizationLevel::None < AnonymizationLevel::Minimal);
        assert!(AnonymizationLevel::Minimal < AnonymizationLevel::Partial);
        assert!(AnonymizationLevel::Partial < AnonymizationLevel::Full);

        assert_eq!(
            AnonymizationLevel::Partial.stricter(AnonymizationLevel::Minimal),
            AnonymizationLevel::Partial
        );
        assert_eq!(
            AnonymizationLevel::Minimal.stricter(AnonymizationLevel::Full),
            AnonymizationLevel::Full
        );
        assert!(AnonymizationLevel::Minimal.is_weaker_than(&AnonymizationLevel::Partial));
        assert!(!AnonymizationLevel::Full.is_weaker_than(&AnonymizationLevel::Full));
    }

    #[test]
    fn test_level_parse_roundtrip() {
        for level in AnonymizationLevel::ALL {
            assert_eq!(level.as_str().parse::<AnonymizationLevel>().unwrap(), level);
        }
        assert!("pseudonymous".parse::<AnonymizationLevel>().is_err());
    }

    #[test]
    fn test_tier_order() {
        let mut sorted = TrustTier::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, TrustTier::ALL.to_vec());
        assert!(TrustTier::Untrusted < TrustTier::Provisional);
        assert_eq!("Trusted".parse::<TrustTier>().unwrap(), TrustTier::Trusted);
    }

    #[test]
    fn test_level_serde_is_snake_case() {
        let json = serde_json::to_string(&AnonymizationLevel::Partial).unwrap();
        assert_eq!(json, "\"partial\"");
    }

    #[test]
    fn test_actor_display() {
        let actor = Actor::buyer(&BuyerId::new("acme"));
        assert_eq!(actor.to_string(), "buyer:acme");
        assert_eq!(ActorKind::parse("admin"), Some(ActorKind::Admin));
    }
}
