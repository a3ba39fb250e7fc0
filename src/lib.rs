//! Consent Ledger Library
//!
//! Consent ledger, buyer trust scoring and tiered data packaging with a
//! hash-chained audit trail.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (grants, requests, decisions, packages, audit entries)
//! - [`infra`] - Storage traits and implementations (in-memory, SQLite), clocks, errors
//! - [`crypto`] - Audit entry hashing, payload digests and access tokens
//! - [`audit`] - Append-only audit trail, chain verification and the integrity alarm
//! - [`ledger`] - Authoritative grant and revocation store
//! - [`validator`] - Consent validation and access decisions
//! - [`trust`] - Buyer trust scoring, snapshot arena and recompute worker
//! - [`packaging`] - Anonymization, release verification and package issuance
//! - [`service`] - [`ConsentCore`] facade wiring everything together
//! - [`metrics`] - In-process counters, gauges and histograms
//! - [`telemetry`] - Structured logging setup

pub mod audit;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod infra;
pub mod ledger;
pub mod metrics;
pub mod migrations;
pub mod packaging;
pub mod service;
pub mod telemetry;
pub mod trust;
pub mod validator;

// Re-export commonly used types
pub use domain::{
    AccessRequest, Actor, AnonymizationLevel, AuditEntry, BuyerId, ConsentGrant, DataCategory,
    Decision, DecisionOutcome, DenialReason, GrantId, NewGrant, PackageId, PackageIssue,
    RevocationReason, TrustProfile, TrustTier, UserId,
};

pub use config::CoreConfig;
pub use infra::{LedgerError, Result};
pub use service::ConsentCore;
