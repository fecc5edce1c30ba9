use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with deterministic jitter and a delay cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 200,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Retries immediately-ish with a tiny base delay; intended for tests.
    pub fn fast(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 10,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Delay before retry number `attempt` (zero-based).
pub fn compute_backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let raw = policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(attempt as i32);
    let capped = raw.min(policy.max_delay_ms as f64);
    let ms = if policy.jitter {
        capped * jitter_factor(attempt)
    } else {
        capped
    };
    Duration::from_millis(ms.max(0.0) as u64)
}

/// Run `operation` until it succeeds, returns a non-retryable error, or exhausts
/// `policy.max_retries`. `on_retry` sees each failure with its attempt number and delay.
pub async fn retry_async<T, E, Op, Fut>(
    policy: &RetryPolicy,
    retryable: impl Fn(&E) -> bool,
    mut on_retry: impl FnMut(&E, u32, Duration),
    mut operation: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !retryable(&error) || attempt >= policy.max_retries {
                    return Err(error);
                }
                let delay = compute_backoff_delay(policy, attempt);
                on_retry(&error, attempt, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn jitter_factor(attempt: u32) -> f64 {
    // splitmix64 of the attempt, mapped to [0.5, 1.5).
    let mut x = u64::from(attempt).wrapping_add(0x9e3779b97f4a7c15);
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    0.5 + (x % 10_000) as f64 / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 350,
            jitter: false,
            ..RetryPolicy::default()
        };
        let delays: Vec<u64> = (0..4)
            .map(|n| compute_backoff_delay(&policy, n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let policy = RetryPolicy::default();
        let a = compute_backoff_delay(&policy, 2);
        assert_eq!(a, compute_backoff_delay(&policy, 2));
        assert!(a >= Duration::from_millis(400) && a <= Duration::from_millis(1_200));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let mut retries = Vec::new();
        let result: Result<u32, &str> = retry_async(
            &RetryPolicy::fast(5),
            |_| true,
            |_, attempt, _| retries.push(attempt),
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("down") } else { Ok(n) }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(retries, vec![0, 1]);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), &str> = retry_async(
            &RetryPolicy::fast(2),
            |_| true,
            |_, _, _| {},
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
