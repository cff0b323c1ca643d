//! Poll-and-sleep primitives shared by every wait loop.
//!
//! Absence of a signal is never an error here: probes return `Ok(None)` until
//! the thing they watch shows up. A loop ends only when the probe yields a
//! value, the token is cancelled, or an explicitly configured deadline passes.

use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    pub interval: Duration,
    /// Upper bound for the interval once backoff kicks in.
    pub max_interval: Duration,
    /// Multiplier applied to the interval after each empty probe; 1.0 keeps
    /// the interval fixed.
    pub backoff: f64,
    /// `None` waits forever.
    pub deadline: Option<Duration>,
}

impl WaitPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            backoff: 1.0,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff = factor.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        if self.backoff <= 1.0 {
            return current;
        }
        let scaled = current.mul_f64(self.backoff);
        scaled.min(self.max_interval)
    }
}

/// Sleeps for `duration`, waking early with `Cancelled` if the token fires.
pub fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
    what: &str,
) -> Result<(), RelayError> {
    let end = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled(what.to_string()));
        }
        let now = Instant::now();
        if now >= end {
            return Ok(());
        }
        thread::sleep((end - now).min(SLEEP_SLICE));
    }
}

/// Runs `probe` until it yields a value. Probe errors propagate; use
/// `Ok(None)` for transient conditions.
pub fn wait_until<T, F>(
    what: &str,
    policy: &WaitPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> anyhow::Result<Option<T>>,
{
    let started = Instant::now();
    let mut interval = policy.interval;
    loop {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled(what.to_string()).into());
        }
        if let Some(value) = probe()? {
            return Ok(value);
        }
        if let Some(limit) = policy.deadline {
            if started.elapsed() >= limit {
                return Err(RelayError::DeadlineExceeded {
                    what: what.to_string(),
                    limit,
                }
                .into());
            }
        }
        sleep_cancellable(interval, cancel, what)?;
        interval = policy.next_interval(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_until_returns_first_value() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let got = wait_until(
            "counting",
            &WaitPolicy::fixed(Duration::from_millis(1)),
            &cancel,
            || {
                calls += 1;
                Ok(if calls == 3 { Some(calls) } else { None })
            },
        )
        .expect("value");
        assert_eq!(got, 3);
    }

    #[test]
    fn cancelled_token_stops_the_loop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait_until::<(), _>(
            "never",
            &WaitPolicy::fixed(Duration::from_millis(1)),
            &cancel,
            || Ok(None),
        )
        .expect_err("cancelled");
        match err.downcast_ref::<RelayError>() {
            Some(RelayError::Cancelled(what)) => assert_eq!(what, "never"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn deadline_is_opt_in() {
        let cancel = CancellationToken::new();
        let policy = WaitPolicy::fixed(Duration::from_millis(2))
            .with_deadline(Some(Duration::from_millis(10)));
        let err = wait_until::<(), _>("stuck login", &policy, &cancel, || Ok(None))
            .expect_err("deadline");
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::DeadlineExceeded { .. })
        ));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = WaitPolicy::fixed(Duration::from_millis(100))
            .with_backoff(2.0, Duration::from_millis(300));
        let a = policy.next_interval(policy.interval);
        let b = policy.next_interval(a);
        let c = policy.next_interval(b);
        assert_eq!(a, Duration::from_millis(200));
        assert_eq!(b, Duration::from_millis(300));
        assert_eq!(c, Duration::from_millis(300));
    }
}
