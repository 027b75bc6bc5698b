use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ZbackError};

/// Shared retry policy, parameterized per call site.
///
/// One policy object serves every backend and subprocess call; per-backend
/// retry loops are deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first (so `max_retries = 3` means up to
    /// four calls).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Backoff cap.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): exponential base 2,
    /// jittered by ±20 %, capped at `max_delay_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << (attempt - 1).min(20));
        let capped = exp.min(self.max_delay_ms);
        // ±20 % jitter so mirrored destinations don't retry in lock-step.
        let spread = capped / 5;
        let jitter = if spread > 0 {
            rand::random::<u64>() % (2 * spread + 1)
        } else {
            0
        };
        Duration::from_millis(capped - spread + jitter)
    }
}

/// Run `f`, retrying transient failures with backoff until the policy's
/// budget is exhausted. Permanent, authz and not-found errors fail on the
/// first occurrence.
///
/// Cancellation-aware: the shutdown flag is checked before every attempt and
/// while sleeping between attempts.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    op_name: &str,
    shutdown: Option<&AtomicBool>,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if shutdown.is_some_and(|s| s.load(Ordering::Relaxed)) {
            return Err(ZbackError::Interrupted);
        }
        if attempt > 0 {
            let delay = policy.backoff_delay(attempt);
            if !sleep_cancellable(delay, shutdown) {
                return Err(ZbackError::Interrupted);
            }
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                tracing::warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    policy.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    // Loop always returns earlier; the final transient error lands here.
    Err(last_err.unwrap_or_else(|| ZbackError::Other(format!("{op_name}: retry loop exhausted"))))
}

/// Sleep in short slices so a shutdown request is honored promptly.
/// Returns `false` if interrupted.
fn sleep_cancellable(total: Duration, shutdown: Option<&AtomicBool>) -> bool {
    const SLICE: Duration = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown.is_some_and(|s| s.load(Ordering::Relaxed)) {
            return false;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
    true
}
