//! Bounded retries with decorrelated-jitter exponential backoff and a wall
//! clock deadline, for wrapping a single unit of async work.

mod manager;
mod policy;

pub use manager::call_with_retry;
pub use policy::{transient_storage_policy, ErrorPredicate, ResultPredicate, RetryPolicy};

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn stops_immediately_when_no_predicate_set() {
        let policy: RetryPolicy<i32, &str> = RetryPolicy::none();
        let calls = AtomicU32::new(0);

        let result = call_with_retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, &str>("boom") }
        })
        .await;

        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_max_tries_then_surfaces_last_error() {
        tokio::time::pause();
        let policy = RetryPolicy::<i32, &str>::new(
            3,
            Duration::from_secs(10),
            Duration::from_millis(1),
            Duration::from_millis(10),
        )
        .retry_on_error(|_| true);

        let calls = AtomicU32::new(0);
        let result = call_with_retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, &str>("transient") }
        })
        .await;

        assert_eq!(result, Err("transient"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_once_check_result_stops_asking_for_retry() {
        tokio::time::pause();
        let policy = RetryPolicy::<i32, &str>::new(
            5,
            Duration::from_secs(10),
            Duration::from_millis(1),
            Duration::from_millis(10),
        )
        .retry_on_result(|v| *v < 2);

        let calls = AtomicU32::new(0);
        let result = call_with_retry(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<i32, &str>(n as i32) }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deadline_cuts_retries_short_even_under_max_tries() {
        tokio::time::pause();
        let policy = RetryPolicy::<i32, &str>::new(
            100,
            Duration::from_millis(5),
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .retry_on_error(|_| true);

        let calls = AtomicU32::new(0);
        let result = call_with_retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, &str>("still failing") }
        })
        .await;

        assert_eq!(result, Err("still failing"));
        // The first attempt is made before the deadline; the second would
        // only fire after a 100ms backoff, which overruns the 5ms deadline,
        // so the loop stops at two attempts total.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
