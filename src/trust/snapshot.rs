//! Versioned arena of immutable trust profiles
//!
//! Readers clone an `Arc` and never observe a partially updated profile.
//! Each buyer keeps a bounded history ordered by `as_of_sequence`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::domain::{BuyerId, TrustProfile};

pub struct TrustSnapshots {
    profiles: RwLock<HashMap<BuyerId, Vec<Arc<TrustProfile>>>>,
    history_depth: usize,
}

impl TrustSnapshots {
    pub fn new(history_depth: usize) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            history_depth: history_depth.max(1),
        }
    }

    /// Publish a profile. Returns the profile now current for the buyer.
    ///
    /// Stale profiles (older than the current one) are dropped, and
    /// republishing an identical profile does not add a version.
    pub async fn publish(&self, profile: TrustProfile) -> Arc<TrustProfile> {
        let mut profiles = self.profiles.write().await;
        let history = profiles.entry(profile.buyer_id.clone()).or_default();

        if let Some(current) = history.last() {
            if current.as_of_sequence > profile.as_of_sequence || **current == profile {
                return current.clone();
            }
            if current.as_of_sequence == profile.as_of_sequence {
                history.pop();
            }
        }

        let profile = Arc::new(profile);
        history.push(profile.clone());
        if history.len() > self.history_depth {
            let excess = history.len() - self.history_depth;
            history.drain(..excess);
        }
        profile
    }

    pub async fn current(&self, buyer_id: &BuyerId) -> Option<Arc<TrustProfile>> {
        self.profiles
            .read()
            .await
            .get(buyer_id)
            .and_then(|h| h.last().cloned())
    }

    /// Retained versions, oldest first
    pub async fn history(&self, buyer_id: &BuyerId) -> Vec<Arc<TrustProfile>> {
        self.profiles
            .read()
            .await
            .get(buyer_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Newest retained profile computed at or before `sequence`
    pub async fn at_sequence(&self, buyer_id: &BuyerId, sequence: u64) -> Option<Arc<TrustProfile>> {
        self.profiles.read().await.get(buyer_id).and_then(|h| {
            h.iter()
                .rev()
                .find(|p| p.as_of_sequence <= sequence)
                .cloned()
        })
    }

    pub async fn buyers(&self) -> Vec<BuyerId> {
        let mut buyers: Vec<BuyerId> = self.profiles.read().await.keys().cloned().collect();
        buyers.sort();
        buyers
    }

    pub async fn clear(&self) {
        self.profiles.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TrustTier;
    use chrono::{TimeZone, Utc};

    fn profile(buyer: &str, seq: u64, score: u8) -> TrustProfile {
        let mut p = TrustProfile::initial(
            BuyerId::new(buyer),
            TrustTier::Standard,
            seq,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        p.score = score;
        p
    }

    #[tokio::test]
    async fn test_publish_and_read() {
        let arena = TrustSnapshots::new(8);
        let buyer = BuyerId::new("acme");
        assert!(arena.current(&buyer).await.is_none());

        arena.publish(profile("acme", 1, 50)).await;
        arena.publish(profile("acme", 5, 60)).await;
        assert_eq!(arena.current(&buyer).await.unwrap().score, 60);
        assert_eq!(arena.history(&buyer).await.len(), 2);
        assert_eq!(arena.at_sequence(&buyer, 4).await.unwrap().score, 50);
        assert!(arena.at_sequence(&buyer, 0).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_profiles_ignored() {
        let arena = TrustSnapshots::new(8);
        let buyer = BuyerId::new("acme");
        arena.publish(profile("acme", 5, 60)).await;

        let current = arena.publish(profile("acme", 3, 10)).await;
        assert_eq!(current.score, 60);

        let again = arena.publish(profile("acme", 5, 60)).await;
        assert_eq!(again.score, 60);
        assert_eq!(arena.history(&buyer).await.len(), 1);

        // Same position, different content replaces in place.
        arena.publish(profile("acme", 5, 65)).await;
        assert_eq!(arena.history(&buyer).await.len(), 1);
        assert_eq!(arena.current(&buyer).await.unwrap().score, 65);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let arena = TrustSnapshots::new(3);
        for seq in 1..=10 {
            arena.publish(profile("acme", seq, seq as u8)).await;
        }
        let history = arena.history(&BuyerId::new("acme")).await;
        assert_eq!(
            history.iter().map(|p| p.as_of_sequence).collect::<Vec<_>>(),
            vec![8, 9, 10]
        );
        assert_eq!(arena.buyers().await, vec![BuyerId::new("acme")]);
    }
}
