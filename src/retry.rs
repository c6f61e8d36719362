//! Bounded polling for readiness waits
//!
//! The action executor waits synchronously for DaemonSets and pods to become
//! ready, always with the same fixed budget of attempts. This module provides
//! that loop in one place so every wait logs and gives up the same way.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::{Result, WAIT_FOR_DAEMON_ATTEMPTS, WAIT_FOR_DAEMON_INTERVAL};

/// A fixed polling budget: `attempts` probes spaced by `interval`
#[derive(Clone, Copy, Debug)]
pub struct PollBudget {
    /// Probes granted before giving up
    pub attempts: u32,
    /// Delay between probes
    pub interval: Duration,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            attempts: WAIT_FOR_DAEMON_ATTEMPTS,
            interval: WAIT_FOR_DAEMON_INTERVAL,
        }
    }
}

/// Poll `probe` until it yields a value or the budget runs out.
///
/// The probe decides the outcome of each attempt:
/// - `Ok(Some(v))` ends the wait successfully,
/// - `Ok(None)` sleeps and probes again,
/// - `Err(e)` aborts the wait immediately.
///
/// Returns `Ok(None)` when the budget is exhausted; the caller decides which
/// timeout error that maps to.
pub async fn poll_until<F, Fut, T>(
    budget: PollBudget,
    operation: &str,
    mut probe: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 1..=budget.attempts {
        if let Some(value) = probe().await? {
            return Ok(Some(value));
        }
        debug!(
            operation = operation,
            attempt = format!("{attempt}/{}", budget.attempts),
            "waiting"
        );
        tokio::time::sleep(budget.interval).await;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(attempts: u32) -> PollBudget {
        PollBudget {
            attempts,
            interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn returns_the_value_on_first_success() {
        let out = poll_until(quick(3), "op", || async { Ok(Some(7)) }).await.unwrap();
        assert_eq!(out, Some(7));
    }

    #[tokio::test]
    async fn keeps_probing_until_ready() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let out = poll_until(quick(5), "op", move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(None)
                } else {
                    Ok(Some("ready"))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, Some("ready"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_yields_none() {
        let out: Option<()> = poll_until(quick(3), "op", || async { Ok(None) }).await.unwrap();
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn probe_errors_abort_the_wait() {
        let result: crate::Result<Option<()>> = poll_until(quick(3), "op", || async {
            Err(crate::Error::unrecoverable("probe failed"))
        })
        .await;
        assert!(result.is_err());
    }
}
