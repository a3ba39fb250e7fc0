//! Error types for the consent ledger

use thiserror::Error;

use crate::domain::{GrantId, PackageId};

/// Errors that can occur in the consent ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Grant failed well-formedness or uniqueness checks
    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    /// Access request failed boundary validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Grant not found
    #[error("grant not found: {0}")]
    GrantNotFound(GrantId),

    /// Buyer was never onboarded
    #[error("buyer not found: {0}")]
    BuyerNotFound(String),

    /// Package not found
    #[error("package not found: {0}")]
    PackageNotFound(PackageId),

    /// Grant already carries a revocation
    #[error("grant already revoked: {0}")]
    AlreadyRevoked(GrantId),

    /// Grant became inactive between decision and packaging
    #[error("consent state changed for grant {0}")]
    StateChanged(GrantId),

    /// Buyer tier is below the minimum acceptable tier
    #[error("trust floor not met for buyer {0}")]
    TrustFloor(String),

    /// Audit chain verification failed; packaging is halted
    #[error("audit chain integrity failure at sequence {sequence}")]
    ChainIntegrity { sequence: u64 },

    /// Decision does not permit packaging
    #[error("decision not releasable: {0}")]
    NotReleasable(String),

    /// Transformed payload still exposes excluded data
    #[error("release verification failed: {0}")]
    ReleaseVerification(String),

    /// Caller deadline elapsed before commit
    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    /// Concurrent append raced the chain head
    #[error("audit sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict { expected: u64, actual: u64 },

    /// Access token has expired
    #[error("access token expired for package {0}")]
    TokenExpired(PackageId),

    /// Access token does not match
    #[error("invalid access token")]
    InvalidToken,

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Safe to re-validate and retry once
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StateChanged(_))
    }

    /// Stable machine-readable code. Never carries integrity details.
    pub fn public_code(&self) -> &'static str {
        match self {
            LedgerError::Database(_)
            | LedgerError::Serialization(_)
            | LedgerError::SequenceConflict { .. }
            | LedgerError::Configuration(_)
            | LedgerError::Internal(_) => "internal_error",
            LedgerError::InvalidGrant(_) => "invalid_grant",
            LedgerError::InvalidRequest(_) => "invalid_request",
            LedgerError::GrantNotFound(_)
            | LedgerError::BuyerNotFound(_)
            | LedgerError::PackageNotFound(_) => "not_found",
            LedgerError::AlreadyRevoked(_) => "already_revoked",
            LedgerError::StateChanged(_) => "state_changed",
            LedgerError::TrustFloor(_) => "trust_floor_not_met",
            LedgerError::ChainIntegrity { .. } => "service_halted",
            LedgerError::NotReleasable(_) => "not_releasable",
            LedgerError::ReleaseVerification(_) => "packaging_failed",
            LedgerError::DeadlineExceeded(_) => "deadline_exceeded",
            LedgerError::TokenExpired(_) => "token_expired",
            LedgerError::InvalidToken => "invalid_token",
        }
    }
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;
