use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::policy::RetryPolicy;

/// Runs `f` under `policy`: exponential backoff starting at `min_delay`,
/// doubling each attempt and capped at `max_delay`, with a uniform `[1, 2)`
/// jitter multiplier applied to decorrelate concurrent retriers. Stops once
/// `max_tries` is reached or `timeout` has elapsed since the first attempt,
/// surfacing the final outcome either way.
///
/// Only `f`'s own outcome is retried. Any work the caller does with the
/// returned `Ok(T)` runs after this function returns and is not wrapped by
/// this loop, so a failure in that continuation is never retried.
pub async fn call_with_retry<T, E, F, Fut>(policy: &RetryPolicy<T, E>, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut delay = policy.min_delay;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let result = f().await;

        let should_retry = match &result {
            Ok(value) => policy
                .check_result
                .as_ref()
                .map(|check| check(value))
                .unwrap_or(false),
            Err(e) => policy
                .check_exception
                .as_ref()
                .map(|check| check(e))
                .unwrap_or(false),
        };

        if !should_retry {
            return result;
        }

        if attempts >= policy.max_tries || Instant::now() >= deadline {
            debug!(attempts, max_tries = policy.max_tries, "retry budget exhausted");
            return result;
        }

        let capped = delay.min(policy.max_delay);
        let jittered = capped.mul_f64(1.0 + fastrand::f64());
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(jittered.min(remaining)).await;

        delay = double(delay).min(policy.max_delay);
    }
}

fn double(d: Duration) -> Duration {
    d.checked_mul(2).unwrap_or(Duration::MAX)
}
