// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Delays
//!
//! Pure helpers computing how long to wait before the next retry. Dialing and
//! recovery walk the Fibonacci sequence, publishing scales linearly with the
//! attempt number.

use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::warn;

/// Default number of retries performed by the dialer after the first attempt.
pub const DIAL_MAX_RETRIES: u32 = 12;
/// Default number of publish attempts.
pub const PUBLISH_MAX_ATTEMPTS: u32 = 5;
/// Default base delay of the linear publish backoff.
pub const PUBLISH_BASE_DELAY: Duration = Duration::from_secs(2);
/// Default ceiling for a single recovery delay.
pub const RECOVERY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Returns the smallest number of the sequence 1, 1, 2, 3, 5, 8, ... strictly
/// greater than `current`.
pub fn fibonacci_next(current: u64) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    while a <= current {
        let next = a.saturating_add(b);
        if next == a {
            return a;
        }
        a = b;
        b = next;
    }
    a
}

/// Linear backoff: `attempt * base`.
pub fn linear_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt)
}

/// Iterator over Fibonacci delays in whole seconds.
///
/// Starting from a seed of 1 the yielded delays are 2s, 3s, 5s, 8s, ...
/// An optional cap bounds every yielded delay without stopping the sequence.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    current: u64,
    cap: Option<Duration>,
}

impl FibonacciBackoff {
    pub fn new(seed: u64) -> Self {
        FibonacciBackoff {
            current: seed,
            cap: None,
        }
    }

    /// Bounds each delay to `cap`.
    pub fn capped(mut self, cap: Duration) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Advances the sequence and returns the delay to wait now.
    pub fn next_delay(&mut self) -> Duration {
        self.current = fibonacci_next(self.current);
        let delay = Duration::from_secs(self.current);
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        FibonacciBackoff::new(1)
    }
}

impl Iterator for FibonacciBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// How delays grow between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Fibonacci seconds seeded at 1, optionally capped.
    Fibonacci { cap: Option<Duration> },
    /// `attempt * base_delay`.
    Linear,
}

/// Retry configuration for one of the retrying components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Attempt budget. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Dial policy: Fibonacci delays, 12 retries, no cap.
    pub fn dial() -> Self {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_attempts: Some(DIAL_MAX_RETRIES),
            backoff: Backoff::Fibonacci { cap: None },
        }
    }

    /// Publish policy: `attempt * 2s`, 5 attempts.
    pub fn publish() -> Self {
        RetryPolicy {
            base_delay: PUBLISH_BASE_DELAY,
            max_attempts: Some(PUBLISH_MAX_ATTEMPTS),
            backoff: Backoff::Linear,
        }
    }

    /// Recovery policy: capped Fibonacci delays, unbounded attempts.
    pub fn recovery() -> Self {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_attempts: None,
            backoff: Backoff::Fibonacci {
                cap: Some(RECOVERY_MAX_DELAY),
            },
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Returns whether `attempts` used up the budget. Never true when unbounded.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Returns the successive delays produced by this policy.
    ///
    /// The n-th item (1-based) is the wait after the n-th failed attempt.
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self.backoff {
            Backoff::Fibonacci { cap } => {
                let fib = FibonacciBackoff::default();
                let base = self.base_delay;
                let iter = fib.map(move |d| scale(base, d.as_secs()));
                match cap {
                    Some(cap) => Box::new(iter.map(move |d| d.min(cap))),
                    None => Box::new(iter),
                }
            }
            Backoff::Linear => {
                let base = self.base_delay;
                Box::new((1u32..).map(move |attempt| linear_delay(attempt, base)))
            }
        }
    }
}

/// `base * factor`, saturating at `Duration::MAX`.
fn scale(base: Duration, factor: u64) -> Duration {
    let nanos = base.as_nanos().saturating_mul(u128::from(factor));
    let secs = nanos / 1_000_000_000;

    match u64::try_from(secs) {
        Ok(secs) => Duration::new(secs, (nanos % 1_000_000_000) as u32),
        Err(_) => Duration::MAX,
    }
}

/// Runs `f` up to `attempts` times, waiting `wait` between failures.
///
/// Returns the first success or the last error.
pub async fn retry<T, E, F, Fut>(attempts: u32, wait: Duration, mut f: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                warn!(error = err.to_string(), attempt, "retrying after error");
                sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fibonacci_next_is_strictly_greater() {
        assert_eq!(fibonacci_next(0), 1);
        assert_eq!(fibonacci_next(1), 2);
        assert_eq!(fibonacci_next(2), 3);
        assert_eq!(fibonacci_next(4), 5);
        assert_eq!(fibonacci_next(5), 8);
        assert_eq!(fibonacci_next(8), 13);
        assert_eq!(fibonacci_next(100), 144);
    }

    #[test]
    fn fibonacci_next_returns_smallest_member() {
        let sequence = [1u64, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610];
        for n in 0..600u64 {
            let next = fibonacci_next(n);
            assert!(next > n);
            assert!(sequence.contains(&next));
            assert!(sequence.iter().filter(|v| **v > n).all(|v| *v >= next));
        }
    }

    #[test]
    fn fibonacci_next_does_not_overflow() {
        assert!(fibonacci_next(u64::MAX - 1) > 0);
    }

    #[test]
    fn linear_delay_scales_with_attempt() {
        let base = Duration::from_secs(2);
        for attempt in 1..20 {
            assert_eq!(linear_delay(attempt, base), base * attempt);
        }
        assert_eq!(
            linear_delay(3, Duration::from_millis(250)),
            Duration::from_millis(750)
        );
    }

    #[test]
    fn fibonacci_backoff_starts_at_two_seconds() {
        let delays: Vec<u64> = FibonacciBackoff::default()
            .take(6)
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![2, 3, 5, 8, 13, 21]);
    }

    #[test]
    fn capped_backoff_keeps_yielding_cap() {
        let delays: Vec<Duration> = FibonacciBackoff::default()
            .capped(Duration::from_secs(10))
            .take(8)
            .collect();
        assert_eq!(delays[3], Duration::from_secs(8));
        assert!(delays[4..].iter().all(|d| *d == Duration::from_secs(10)));
    }

    #[test]
    fn publish_policy_delays_are_linear() {
        let delays: Vec<Duration> = RetryPolicy::publish().delays().take(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6),
                Duration::from_secs(8)
            ]
        );
    }

    #[test]
    fn recovery_policy_is_capped() {
        let last = RetryPolicy::recovery().delays().nth(20).unwrap();
        assert_eq!(last, RECOVERY_MAX_DELAY);
    }

    #[test]
    fn uncapped_delays_keep_growing_past_u32_seconds() {
        let delays: Vec<Duration> = RetryPolicy::dial().delays().take(60).collect();

        assert!(delays.windows(2).all(|w| w[1] > w[0]));
        assert!(delays[59].as_secs() > u64::from(u32::MAX));
    }

    #[test]
    fn sub_second_base_scales_fibonacci_steps() {
        let delays: Vec<Duration> = RetryPolicy::dial()
            .base_delay(Duration::from_millis(500))
            .delays()
            .take(3)
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_millis(1500),
                Duration::from_millis(2500)
            ]
        );
    }

    #[test]
    fn attempt_budget() {
        assert!(!RetryPolicy::publish().exhausted(PUBLISH_MAX_ATTEMPTS - 1));
        assert!(RetryPolicy::publish().exhausted(PUBLISH_MAX_ATTEMPTS));
        assert!(!RetryPolicy::recovery().exhausted(u32::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let start = tokio::time::Instant::now();
        let mut calls = 0;

        let res: Result<u32, String> = retry(5, Duration::from_secs(1), || {
            calls += 1;
            let current = calls;
            async move {
                if current < 3 {
                    Err("boom".to_owned())
                } else {
                    Ok(current)
                }
            }
        })
        .await;

        assert_eq!(res, Ok(3));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_last_error() {
        let mut calls = 0;

        let res: Result<(), String> = retry(3, Duration::from_secs(1), || {
            calls += 1;
            let current = calls;
            async move { Err(format!("failure {current}")) }
        })
        .await;

        assert_eq!(res, Err("failure 3".to_owned()));
        assert_eq!(calls, 3);
    }
}
