//! Exponential backoff for the hub connect loop.
//!
//! [`Retry`] presents an asynchronous sequence of attempt counts
//! `1, 2, 3, ...`. Between attempts it suspends for
//! `uniform(0, 1) * clamp(attempt^2, min_wait, max_wait)` seconds, so the
//! worst case backoff is bounded and successive bridges don't reconnect in
//! lockstep. A done signal terminates the sequence, waking any in-progress
//! sleep immediately.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default minimum backoff in seconds.
const DEFAULT_MIN_WAIT: f64 = 2.0;

/// Default maximum backoff in seconds.
const DEFAULT_MAX_WAIT: f64 = 16.0;

/// Manage exponential backoff.
#[derive(Debug)]
pub struct Retry {
    min_wait: f64,
    max_wait: f64,
    done: CancellationToken,
    retry_count: u32,
    yielded: bool,
}

impl Retry {
    /// Create a retry sequence terminated by `done`.
    #[must_use]
    pub fn new(done: CancellationToken) -> Self {
        Self::with_waits(done, DEFAULT_MIN_WAIT, DEFAULT_MAX_WAIT)
    }

    /// Create a retry sequence with explicit backoff bounds.
    #[must_use]
    pub fn with_waits(done: CancellationToken, min_wait: f64, max_wait: f64) -> Self {
        Self {
            min_wait,
            max_wait,
            done,
            retry_count: 0,
            yielded: false,
        }
    }

    /// The current attempt count.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Call when a connection was successful, resetting the backoff.
    pub fn success(&mut self) {
        self.retry_count = 0;
    }

    /// Terminate the sequence.
    pub fn done(&self) {
        self.done.cancel();
    }

    /// Advance to the next attempt.
    ///
    /// Sleeps the backoff interval first (except before the very first
    /// attempt), then returns the new attempt count, or `None` once the done
    /// signal is set.
    pub async fn next(&mut self) -> Option<u32> {
        if self.yielded {
            let sleep_for = self.backoff();
            log::debug!("retrying after {}ms", (sleep_for * 1000.0) as u64);
            tokio::select! {
                () = self.done.cancelled() => {}
                () = tokio::time::sleep(Duration::from_secs_f64(sleep_for)) => {}
            }
        }
        if self.done.is_cancelled() {
            return None;
        }
        self.yielded = true;
        self.retry_count += 1;
        Some(self.retry_count)
    }

    /// Compute the next sleep interval in seconds.
    fn backoff(&self) -> f64 {
        let retry_squared = f64::from(self.retry_count).powi(2);
        rand::random::<f64>() * self.min_wait.max(self.max_wait.min(retry_squared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_within_bounds() {
        let mut retry = Retry::new(CancellationToken::new());
        for attempt in 1..=100 {
            retry.retry_count = attempt;
            let backoff = retry.backoff();
            assert!(
                (0.0..=DEFAULT_MAX_WAIT).contains(&backoff),
                "attempt {attempt} slept {backoff}"
            );
        }
    }

    /// Waits small enough that real sleeps don't slow the suite down.
    fn fast_retry(token: CancellationToken) -> Retry {
        Retry::with_waits(token, 0.01, 0.02)
    }

    #[tokio::test]
    async fn test_attempt_counts_increment() {
        let mut retry = fast_retry(CancellationToken::new());
        assert_eq!(retry.next().await, Some(1));
        assert_eq!(retry.next().await, Some(2));
        assert_eq!(retry.next().await, Some(3));
    }

    #[tokio::test]
    async fn test_success_resets_the_counter() {
        let mut retry = fast_retry(CancellationToken::new());
        assert_eq!(retry.next().await, Some(1));
        assert_eq!(retry.next().await, Some(2));
        retry.success();
        assert_eq!(retry.next().await, Some(1));
    }

    #[tokio::test]
    async fn test_done_terminates_the_sequence() {
        let token = CancellationToken::new();
        let mut retry = fast_retry(token.clone());
        assert_eq!(retry.next().await, Some(1));
        token.cancel();
        assert_eq!(retry.next().await, None);
        assert_eq!(retry.next().await, None);
    }

    #[tokio::test]
    async fn test_done_wakes_an_in_progress_sleep() {
        let token = CancellationToken::new();
        let mut retry = Retry::with_waits(token.clone(), 30.0, 60.0);
        retry.retry_count = 10;
        retry.yielded = true;

        let canceller = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            }
        });

        let started = std::time::Instant::now();
        assert_eq!(retry.next().await, None);
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.await.unwrap();
    }

    #[test]
    fn test_small_attempts_use_the_minimum_wait() {
        let retry = Retry::new(CancellationToken::new());
        // retry_count == 0 squares to zero; the floor must still apply.
        for _ in 0..50 {
            assert!(retry.backoff() <= DEFAULT_MIN_WAIT);
        }
    }
}
