use std::future::Future;
use std::time::Duration;

/// Exponential backoff: `initial`, doubling per attempt, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay to wait after the `attempt`-th failure (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.min(16);
        self.initial.saturating_mul(exp).min(self.max)
    }
}

/// Outcome of [`retry`]: the last result and how many attempts produced it.
pub(crate) struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Run `op` up to `max_attempts` times, sleeping between failures that
/// `retryable` accepts. A non-retryable error ends the loop immediately.
pub(crate) async fn retry<T, E, F, Fut>(
    backoff: Backoff,
    max_attempts: u32,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Retried<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = op(attempt).await;
        attempt += 1;
        match result {
            Err(ref e) if attempt < max_attempts && retryable(e) => {
                tokio::time::sleep(backoff.delay(attempt - 1)).await;
            }
            result => {
                return Retried {
                    result,
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(4), Duration::from_millis(1_000));
        assert_eq!(b.delay(40), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = retry(
            Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
            5,
            |_: &&str| true,
            move |_| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("flaky")
                } else {
                    Ok(n)
                }
            },
        )
        .await;
        assert_eq!(out.result, Ok(2));
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_attempts_or_fatal_error() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
        let out: Retried<(), &str> = retry(backoff, 3, |_| true, |_| async { Err("down") }).await;
        assert_eq!(out.attempts, 3);

        let out: Retried<(), &str> = retry(backoff, 3, |e| *e != "fatal", |_| async { Err("fatal") }).await;
        assert_eq!(out.attempts, 1);
        assert_eq!(out.result, Err("fatal"));
    }
}
