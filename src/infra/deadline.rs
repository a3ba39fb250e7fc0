//! Caller deadlines
//!
//! Lookup and decision phases run under the deadline. Commits are never
//! interrupted; callers check the deadline once more before committing.

use std::future::Future;

use tokio::time::{timeout_at, Instant};

use super::{LedgerError, Result};

/// Run `fut` under an optional deadline.
pub async fn within_deadline<F, T>(
    deadline: Option<Instant>,
    phase: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = T>,
{
    match deadline {
        Some(deadline) => timeout_at(deadline, fut)
            .await
            .map_err(|_| LedgerError::DeadlineExceeded(phase)),
        None => Ok(fut.await),
    }
}

/// Fail if the deadline has already passed.
pub fn ensure_before(deadline: Option<Instant>, phase: &'static str) -> Result<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(LedgerError::DeadlineExceeded(phase)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_no_deadline_runs_to_completion() {
        let value = within_deadline(None, "lookup", async { 7 }).await.unwrap();
        assert_eq!(value, 7);
        assert!(ensure_before(None, "commit").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_deadline() {
        let deadline = Instant::now() + Duration::from_millis(10);
        let result = within_deadline(Some(deadline), "lookup", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;
        assert!(matches!(result, Err(LedgerError::DeadlineExceeded("lookup"))));
        assert!(ensure_before(Some(deadline), "commit").is_err());
    }
}
