//! Background trust recompute worker
//!
//! Follows the audit broadcast and recomputes a buyer right after a
//! qualifying entry lands, recomputes every buyer on a fixed interval, and
//! falls back to a full pass when it lags behind the broadcast.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::engine::TrustEngine;
use super::scoring::affects_score;
use crate::config::TrustWorkerConfig;
use crate::domain::{AuditEntry, BuyerId};

const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Control messages for the recompute worker
#[derive(Debug)]
pub enum TrustWorkerMessage {
    RecomputeBuyer(BuyerId),
    RecomputeAll,
    Shutdown,
}

pub struct TrustRecomputeWorker {
    config: TrustWorkerConfig,
    engine: Arc<TrustEngine>,
    events: broadcast::Receiver<AuditEntry>,
    control_rx: mpsc::Receiver<TrustWorkerMessage>,
}

impl TrustRecomputeWorker {
    /// The worker stops once `control_rx` closes, i.e. when every sender
    /// has been dropped.
    pub fn new(
        config: TrustWorkerConfig,
        engine: Arc<TrustEngine>,
        events: broadcast::Receiver<AuditEntry>,
        control_rx: mpsc::Receiver<TrustWorkerMessage>,
    ) -> Self {
        Self {
            config,
            engine,
            events,
            control_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.recompute_interval.as_secs(),
            eager = self.config.eager,
            "starting trust recompute worker"
        );

        let mut ticker = interval(self.config.recompute_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the arena is already warm.
        ticker.tick().await;

        let mut events_open = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.recompute_all().await;
                }
                event = self.events.recv(), if events_open => {
                    match event {
                        Ok(entry) => self.on_entry(&entry).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "trust worker lagged behind audit trail; recomputing all");
                            self.recompute_all().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("audit broadcast closed");
                            events_open = false;
                        }
                    }
                }
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(TrustWorkerMessage::RecomputeBuyer(buyer_id)) => {
                            self.recompute(&buyer_id).await;
                        }
                        Some(TrustWorkerMessage::RecomputeAll) => {
                            self.recompute_all().await;
                        }
                        Some(TrustWorkerMessage::Shutdown) | None => {
                            info!("trust recompute worker shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn on_entry(&self, entry: &AuditEntry) {
        if !self.config.eager || !affects_score(&entry.payload) {
            return;
        }
        if let Some(buyer_id) = entry.buyer_id() {
            self.recompute(buyer_id).await;
        }
    }

    async fn recompute(&self, buyer_id: &BuyerId) {
        if let Err(e) = self.engine.recompute(buyer_id).await {
            warn!(buyer_id = %buyer_id, error = %e, "trust recompute failed");
        }
    }

    async fn recompute_all(&self) {
        if let Err(e) = self.engine.recompute_all().await {
            error!(error = %e, "batch trust recompute failed");
        }
    }
}

/// Spawn the recompute worker as a background task
pub fn spawn_trust_worker(
    config: TrustWorkerConfig,
    engine: Arc<TrustEngine>,
    events: broadcast::Receiver<AuditEntry>,
) -> (
    tokio::task::JoinHandle<()>,
    mpsc::Sender<TrustWorkerMessage>,
) {
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    let worker = TrustRecomputeWorker::new(config, engine, events, control_rx);
    let handle = tokio::spawn(worker.run());
    (handle, control_tx)
}
