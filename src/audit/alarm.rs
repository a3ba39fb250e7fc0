//! Process-wide integrity alarm
//!
//! Raised when chain verification fails. Packaging is refused for everyone
//! until an operator clears the alarm. Nothing read from a broken entry is
//! trusted, so the halt is never narrowed to the parties it names.

use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::infra::{LedgerError, Result};

#[derive(Debug, Default)]
struct AlarmState {
    raised: bool,
    first_broken: Option<u64>,
}

#[derive(Debug, Default)]
pub struct IntegrityAlarm {
    state: RwLock<AlarmState>,
}

impl IntegrityAlarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Halt packaging. Keeps the lowest broken sequence seen so far.
    pub async fn raise(&self, sequence: u64) {
        let mut state = self.state.write().await;
        state.raised = true;
        state.first_broken = Some(state.first_broken.map_or(sequence, |s| s.min(sequence)));
        error!(
            sequence,
            first_broken = ?state.first_broken,
            "audit chain integrity failure; packaging halted"
        );
    }

    /// Fail with `ChainIntegrity` while the alarm is raised.
    pub async fn check(&self) -> Result<()> {
        let state = self.state.read().await;
        if state.raised {
            return Err(LedgerError::ChainIntegrity {
                sequence: state.first_broken.unwrap_or(0),
            });
        }
        Ok(())
    }

    pub async fn is_raised(&self) -> bool {
        self.state.read().await.raised
    }

    pub async fn first_broken(&self) -> Option<u64> {
        self.state.read().await.first_broken
    }

    /// Administrative reset after investigation
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        if state.raised {
            warn!(first_broken = ?state.first_broken, "integrity alarm cleared");
        }
        *state = AlarmState::default();
    }
}
