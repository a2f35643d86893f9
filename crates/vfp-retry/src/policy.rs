use std::sync::Arc;
use std::time::Duration;

pub type ResultPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
pub type ErrorPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// A plain value describing when a [`crate::call_with_retry`] invocation
/// should retry. Either predicate may be left unset; both unset means the
/// first attempt's outcome is final.
#[derive(Clone)]
pub struct RetryPolicy<T, E> {
    pub max_tries: u32,
    pub timeout: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub check_result: Option<ResultPredicate<T>>,
    pub check_exception: Option<ErrorPredicate<E>>,
}

impl<T, E> RetryPolicy<T, E> {
    pub fn new(max_tries: u32, timeout: Duration, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_tries,
            timeout,
            min_delay,
            max_delay,
            check_result: None,
            check_exception: None,
        }
    }

    /// No automatic retry: first attempt is always final.
    pub fn none() -> Self {
        Self::new(1, Duration::from_secs(0), Duration::from_secs(0), Duration::from_secs(0))
    }

    pub fn retry_on_result(mut self, pred: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.check_result = Some(Arc::new(pred));
        self
    }

    pub fn retry_on_error(mut self, pred: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.check_exception = Some(Arc::new(pred));
        self
    }
}

/// The bounded-retry policy used by a `UserOpManager` around a handler call:
/// small ceiling, short deadline, so a quarantine-bound op fails fast rather
/// than tying up the user's lock.
pub fn transient_storage_policy<T, E>() -> RetryPolicy<T, E> {
    RetryPolicy::new(
        3,
        Duration::from_secs(30),
        Duration::from_millis(100),
        Duration::from_secs(5),
    )
}
