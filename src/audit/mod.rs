//! Audit trail
//!
//! Single-writer, hash-chained, append-only log of every ledger mutation and
//! access decision. Appends run under one mutex so sequence numbers are
//! assigned in order; the storage layer additionally enforces
//! compare-and-append, so a racing writer in another process fails rather
//! than forking the chain.

mod alarm;
mod verify;

pub use alarm::IntegrityAlarm;
pub use verify::verify_entries;

use std::sync::Arc;

use chrono::SubsecRound;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument, warn};

use crate::crypto::compute_entry_hash;
use crate::domain::{
    Actor, AuditEntry, AuditPayload, BuyerId, ChainFault, ChainHead, ChainVerification,
};
use crate::infra::{Clock, LedgerError, LedgerMutation, LedgerStorage, Result};
use crate::metrics::{metric_names, MetricsRegistry};

/// Capacity of the audit event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct AuditTrail {
    storage: Arc<dyn LedgerStorage>,
    clock: Arc<dyn Clock>,
    head: Mutex<ChainHead>,
    events: broadcast::Sender<AuditEntry>,
    alarm: Arc<IntegrityAlarm>,
    metrics: Arc<MetricsRegistry>,
}

impl AuditTrail {
    /// Open the trail over existing storage, resuming from its head.
    pub async fn open(
        storage: Arc<dyn LedgerStorage>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let head = storage.audit_head().await?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        debug!(sequence = head.sequence, "audit trail opened");
        Ok(Self {
            storage,
            clock,
            head: Mutex::new(head),
            events,
            alarm: Arc::new(IntegrityAlarm::new()),
            metrics,
        })
    }

    pub fn alarm(&self) -> &Arc<IntegrityAlarm> {
        &self.alarm
    }

    /// Receive every entry after it is durable, in sequence order.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.events.subscribe()
    }

    pub async fn head(&self) -> ChainHead {
        *self.head.lock().await
    }

    /// Append an audit-only entry.
    pub async fn append(&self, actor: Actor, payload: AuditPayload) -> Result<AuditEntry> {
        self.record(actor, payload, LedgerMutation::None).await
    }

    /// Append an entry and apply `mutation` in the same storage commit.
    ///
    /// Either both are durable or neither is; the in-memory head only
    /// advances after the commit succeeds.
    #[instrument(skip(self, payload, mutation), fields(actor = %actor, action = %payload.action()))]
    pub(crate) async fn record(
        &self,
        actor: Actor,
        payload: AuditPayload,
        mutation: LedgerMutation,
    ) -> Result<AuditEntry> {
        let mut head = self.head.lock().await;

        let sequence = head.sequence + 1;
        let recorded_at = self.clock.now().trunc_subsecs(6);
        let action = payload.action();
        let entry_hash =
            compute_entry_hash(sequence, &head.hash, &actor, action, &recorded_at, &payload)?;

        let entry = AuditEntry {
            sequence,
            prev_hash: head.hash,
            entry_hash,
            actor,
            action,
            recorded_at,
            payload,
        };

        match self.storage.commit(&entry, &mutation).await {
            Ok(()) => {
                *head = ChainHead {
                    sequence,
                    hash: entry_hash,
                };
                // No subscribers is fine.
                let _ = self.events.send(entry.clone());
                drop(head);
                self.metrics
                    .inc_counter(metric_names::AUDIT_ENTRIES_APPENDED)
                    .await;
                self.metrics
                    .set_gauge(metric_names::AUDIT_HEAD_SEQUENCE, sequence)
                    .await;
                debug!(sequence, "audit entry committed");
                Ok(entry)
            }
            Err(err @ LedgerError::SequenceConflict { .. }) => {
                warn!(error = %err, "audit head moved underneath this writer; reloading");
                if let Ok(actual) = self.storage.audit_head().await {
                    *head = actual;
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Read entries `from..=to`
    pub async fn read_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>> {
        self.storage.read_audit_range(from, to).await
    }

    /// Newest `limit` entries attributable to a buyer, ascending
    pub async fn entries_for_buyer(
        &self,
        buyer_id: &BuyerId,
        up_to: Option<u64>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        self.storage.read_buyer_audit(buyer_id, up_to, limit).await
    }

    /// Recompute hashes over `from..=to` (clamped to the head).
    ///
    /// Reports the first offending sequence number and raises the integrity
    /// alarm on failure. Never repairs anything.
    #[instrument(skip(self))]
    pub async fn verify_chain(&self, from: u64, to: u64) -> Result<ChainVerification> {
        let head = self.storage.audit_head().await?;
        let from = from.max(1);
        let to = to.min(head.sequence);

        self.metrics
            .inc_counter(metric_names::CHAIN_VERIFICATIONS)
            .await;

        if to < from {
            return Ok(ChainVerification {
                from_sequence: from,
                to_sequence: to,
                entries_checked: 0,
                intact: true,
                first_broken: None,
                fault: None,
            });
        }

        let read_from = if from > 1 { from - 1 } else { from };
        let mut entries = match self.storage.read_audit_range(read_from, to).await {
            Ok(entries) => entries,
            Err(LedgerError::Serialization(e)) => {
                warn!(error = %e, "stored audit entry no longer decodes");
                return Err(self.halt(from).await);
            }
            Err(LedgerError::Internal(e)) => {
                warn!(error = %e, "stored audit entry is malformed");
                return Err(self.halt(from).await);
            }
            Err(e) => return Err(e),
        };

        let anchor = if from == 1 {
            ChainHead::genesis().hash
        } else {
            match entries.first() {
                Some(prev) if prev.sequence == from - 1 => {
                    let hash = prev.entry_hash;
                    entries.remove(0);
                    hash
                }
                _ => {
                    let result = ChainVerification {
                        from_sequence: from,
                        to_sequence: to,
                        entries_checked: 0,
                        intact: false,
                        first_broken: Some(from - 1),
                        fault: Some(ChainFault::Missing { expected: from - 1 }),
                    };
                    self.alarm.raise(from - 1).await;
                    return Ok(result);
                }
            }
        };

        let result = verify_entries(&entries, from, to, anchor);
        if !result.intact {
            self.metrics
                .inc_counter(metric_names::CHAIN_FAILURES)
                .await;
            if let Some(sequence) = result.first_broken {
                // Global halt; nothing read from a broken entry is trusted.
                warn!(sequence, fault = ?result.fault, "audit chain verification failed");
                self.alarm.raise(sequence).await;
            }
        }
        Ok(result)
    }

    async fn halt(&self, sequence: u64) -> LedgerError {
        self.metrics
            .inc_counter(metric_names::CHAIN_FAILURES)
            .await;
        self.alarm.raise(sequence).await;
        LedgerError::ChainIntegrity { sequence }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{ManualClock, MemoryStorage, MockLedgerStorage};
    use chrono::{TimeZone, Utc};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ))
    }

    fn onboarded(buyer: &str) -> AuditPayload {
        AuditPayload::BuyerOnboarded {
            buyer_id: BuyerId::new(buyer),
        }
    }

    async fn trail() -> AuditTrail {
        AuditTrail::open(
            Arc::new(MemoryStorage::new()),
            clock(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_append_chains_entries() {
        let trail = trail().await;
        let first = trail
            .append(Actor::system("test"), onboarded("a"))
            .await
            .unwrap();
        let second = trail
            .append(Actor::system("test"), onboarded("b"))
            .await
            .unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(first.prev_hash, [0u8; 32]);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.prev_hash, first.entry_hash);
        assert_eq!(trail.head().await.hash, second.entry_hash);

        let verification = trail.verify_chain(1, u64::MAX).await.unwrap();
        assert!(verification.intact);
        assert_eq!(verification.entries_checked, 2);
        assert_eq!(verification.first_broken, None);
    }

    #[tokio::test]
    async fn test_verify_subrange_and_empty_range() {
        let trail = trail().await;
        for i in 0..5 {
            trail
                .append(Actor::system("test"), onboarded(&format!("b{i}")))
                .await
                .unwrap();
        }
        let partial = trail.verify_chain(3, 4).await.unwrap();
        assert!(partial.intact);
        assert_eq!(partial.entries_checked, 2);

        let empty = trail.verify_chain(9, 12).await.unwrap();
        assert!(empty.intact);
        assert_eq!(empty.entries_checked, 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_durable_entries() {
        let trail = trail().await;
        let mut rx = trail.subscribe();
        trail
            .append(Actor::system("test"), onboarded("a"))
            .await
            .unwrap();
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.sequence, 1);
    }

    #[tokio::test]
    async fn test_failed_commit_does_not_advance_head() {
        let mut storage = MockLedgerStorage::new();
        storage
            .expect_audit_head()
            .returning(|| Ok(ChainHead::genesis()));
        storage
            .expect_commit()
            .times(1)
            .returning(|_, _| Err(LedgerError::Internal("disk full".into())));

        let trail = AuditTrail::open(
            Arc::new(storage),
            clock(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap();

        let result = trail.append(Actor::system("test"), onboarded("a")).await;
        assert!(matches!(result, Err(LedgerError::Internal(_))));
        assert!(trail.head().await.is_genesis());
    }

    #[tokio::test]
    async fn test_sequence_conflict_reloads_head() {
        let moved = ChainHead {
            sequence: 4,
            hash: [4u8; 32],
        };
        let mut storage = MockLedgerStorage::new();
        let mut calls = 0;
        storage.expect_audit_head().returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(ChainHead::genesis())
            } else {
                Ok(moved)
            }
        });
        storage.expect_commit().returning(|_, _| {
            Err(LedgerError::SequenceConflict {
                expected: 5,
                actual: 1,
            })
        });

        let trail = AuditTrail::open(
            Arc::new(storage),
            clock(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap();

        let result = trail.append(Actor::system("test"), onboarded("a")).await;
        assert!(matches!(result, Err(LedgerError::SequenceConflict { .. })));
        assert_eq!(trail.head().await, moved);
    }

    #[tokio::test]
    async fn test_alarm_starts_clear() {
        let trail = trail().await;
        assert!(trail.alarm().check().await.is_ok());
    }

    #[tokio::test]
    async fn test_rewritten_buyer_still_halts_packaging() {
        let source = trail().await;
        source
            .append(Actor::admin("ops"), onboarded("acme"))
            .await
            .unwrap();
        source
            .append(
                Actor::admin("ops"),
                AuditPayload::PolicyViolation {
                    buyer_id: BuyerId::new("acme"),
                    description: "resold location data".into(),
                },
            )
            .await
            .unwrap();

        let head = source.head().await;
        let mut entries = source.read_range(1, 2).await.unwrap();
        entries[1].payload = AuditPayload::PolicyViolation {
            buyer_id: BuyerId::new("someone-else"),
            description: "resold location data".into(),
        };

        let mut storage = MockLedgerStorage::new();
        storage.expect_audit_head().returning(move || Ok(head));
        storage
            .expect_read_audit_range()
            .returning(move |_, _| Ok(entries.clone()));
        let trail = AuditTrail::open(
            Arc::new(storage),
            clock(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap();

        let verification = trail.verify_chain(1, u64::MAX).await.unwrap();
        assert_eq!(verification.first_broken, Some(2));
        assert_eq!(verification.fault, Some(ChainFault::HashMismatch));
        assert!(matches!(
            trail.alarm().check().await,
            Err(LedgerError::ChainIntegrity { sequence: 2 })
        ));
    }
}
