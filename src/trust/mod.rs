//! Trust scoring
//!
//! Buyer trust is derived from the audit trail: a pure scoring pass over a
//! bounded window of the buyer's recent entries, published into a versioned
//! arena of immutable snapshots, and kept fresh by a background worker.

mod engine;
mod scoring;
mod snapshot;
mod worker;

pub use engine::TrustEngine;
pub use scoring::{affects_score, score_history};
pub use snapshot::TrustSnapshots;
pub use worker::{spawn_trust_worker, TrustRecomputeWorker, TrustWorkerMessage};
