//! Cryptographic utilities for the consent ledger
//!
//! Provides:
//! - Domain-separated audit entry hashing over RFC 8785 canonical JSON
//! - Package payload digests
//! - Access token generation and hashing

mod hash;
mod token;

pub use hash::*;
pub use token::*;
