//! Bounded retry with fixed or exponential backoff.

use std::time::Duration;

use tracing::warn;

/// Backoff strategy for [`retry_with_backoff`].
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Fixed delay between attempts.
    Fixed(Duration),
    /// Delay doubles after each attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    fn initial_delay(&self) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { initial, .. } => *initial,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { max, .. } => std::cmp::min(current * 2, *max),
        }
    }
}

/// Runs `attempt_fn` up to `max_attempts` times (at least once).
///
/// On each failure `is_retryable` decides whether another attempt is made;
/// non-retryable errors and the error of the last attempt are returned
/// as-is.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    max_attempts: u32,
    backoff: Backoff,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut delay = backoff.initial_delay();
    let mut attempt = 1;

    loop {
        match attempt_fn().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt >= max_attempts {
                    return Err(e);
                }
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    description,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = backoff.next_delay(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result: Result<i32, String> = retry_with_backoff(
            3,
            Backoff::Fixed(Duration::from_millis(10)),
            "test op",
            || async { Ok(42) },
            |_: &String| true,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_succeeds_on_fourth_attempt() {
        let mut count = 0;
        let result: Result<i32, String> = retry_with_backoff(
            10,
            Backoff::Fixed(Duration::from_millis(5)),
            "test op",
            || {
                count += 1;
                let c = count;
                async move {
                    if c < 4 {
                        Err(format!("refused {}", c))
                    } else {
                        Ok(c)
                    }
                }
            },
            |_: &String| true,
        )
        .await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let mut count = 0;
        let result: Result<i32, String> = retry_with_backoff(
            3,
            Backoff::Fixed(Duration::from_millis(5)),
            "test op",
            || {
                count += 1;
                async { Err("always fails".to_string()) }
            },
            |_: &String| true,
        )
        .await;
        assert_eq!(result.unwrap_err(), "always fails");
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let mut count = 0;
        let _: Result<i32, String> = retry_with_backoff(
            0,
            Backoff::Fixed(Duration::from_millis(5)),
            "test op",
            || {
                count += 1;
                async { Err("fail".to_string()) }
            },
            |_: &String| true,
        )
        .await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_early() {
        let mut count = 0;
        let result: Result<i32, String> = retry_with_backoff(
            5,
            Backoff::Fixed(Duration::from_millis(5)),
            "test op",
            || {
                count += 1;
                let c = count;
                async move { Err(format!("error {}", c)) }
            },
            |e: &String| e != "error 2",
        )
        .await;
        assert_eq!(result.unwrap_err(), "error 2");
        assert_eq!(count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_delay_doubles() {
        let start = tokio::time::Instant::now();
        let result: Result<i32, String> = retry_with_backoff(
            3,
            Backoff::Exponential {
                initial: Duration::from_millis(50),
                max: Duration::from_millis(200),
            },
            "test op",
            || async { Err("fail".to_string()) },
            |_: &String| true,
        )
        .await;
        assert!(result.is_err());
        // 50ms + 100ms between the three attempts
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
