//! Hashing with domain separation
//!
//! Audit entries are chained as
//!
//! ```text
//! entry_hash = SHA256(
//!     b"CONSENT_LEDGER_AUDIT_ENTRY_V1" ||
//!     U64_BE(sequence) ||
//!     prev_hash(32) ||
//!     ENC_STR(actor) ||
//!     ENC_STR(action) ||
//!     ENC_STR(recorded_at, RFC 3339 with microseconds) ||
//!     ENC_STR(JCS(payload))
//! )
//! ```
//!
//! where `ENC_STR` is `U32_BE(len) || utf8` and JCS is RFC 8785 canonical
//! JSON via `serde_json_canonicalizer`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::{Actor, AuditAction, AuditPayload, Hash256};
use crate::infra::{LedgerError, Result};

/// Domain prefix for audit entry hashing
pub const DOMAIN_AUDIT_ENTRY: &[u8] = b"CONSENT_LEDGER_AUDIT_ENTRY_V1";

/// Domain prefix for released package payload digests
pub const DOMAIN_PACKAGE_PAYLOAD: &[u8] = b"CONSENT_LEDGER_PACKAGE_PAYLOAD_V1";

/// Encode a u32 as 4 bytes big-endian
#[inline]
pub fn u32_be(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Encode a u64 as 8 bytes big-endian
#[inline]
pub fn u64_be(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Encode a string as length-prefixed UTF-8 bytes
/// Format: U32_BE(len) || UTF8_bytes
pub fn encode_string(s: &str) -> Vec<u8> {
    let utf8_bytes = s.as_bytes();
    let mut result = Vec::with_capacity(4 + utf8_bytes.len());
    result.extend_from_slice(&u32_be(utf8_bytes.len() as u32));
    result.extend_from_slice(utf8_bytes);
    result
}

/// Convert a JSON value to its RFC 8785 canonical string.
pub fn canonicalize_json(value: &serde_json::Value) -> Result<String> {
    serde_json_canonicalizer::to_string(value).map_err(LedgerError::from)
}

/// Canonical JSON of any serializable value
pub fn canonical_json_of<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    canonicalize_json(&value)
}

/// Timestamp form used inside the hash preimage
pub fn timestamp_preimage(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Compute the hash of one audit entry.
pub fn compute_entry_hash(
    sequence: u64,
    prev_hash: &Hash256,
    actor: &Actor,
    action: AuditAction,
    recorded_at: &DateTime<Utc>,
    payload: &AuditPayload,
) -> Result<Hash256> {
    let canonical = canonical_json_of(payload)?;

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_AUDIT_ENTRY);
    hasher.update(u64_be(sequence));
    hasher.update(prev_hash);
    hasher.update(encode_string(&actor.to_string()));
    hasher.update(encode_string(action.as_str()));
    hasher.update(encode_string(&timestamp_preimage(recorded_at)));
    hasher.update(encode_string(&canonical));
    Ok(hasher.finalize().into())
}

/// Digest of a released payload
///
/// payload_digest = SHA256(b"CONSENT_LEDGER_PACKAGE_PAYLOAD_V1" || JCS(payload))
pub fn payload_digest<T: Serialize>(payload: &T) -> Result<Hash256> {
    let canonical = canonical_json_of(payload)?;

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_PACKAGE_PAYLOAD);
    hasher.update(canonical.as_bytes());
    Ok(hasher.finalize().into())
}

/// Plain SHA-256 rendered as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
