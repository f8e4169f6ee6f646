use std::time::{Duration, Instant};

use tokio::time;

/// Decides whether a failed operation is attempted again.
pub trait RetryPolicy: Send + Sync {
    /// Returns true if another attempt should be made after `attempts`
    /// attempts that took `elapsed` in total.
    ///
    /// With `allow_sleep` set, the calling thread sleeps for
    /// [`RetryPolicy::interval`] before returning true. The sleep always
    /// runs to its deadline; there is no way to interrupt it. Async callers
    /// use [`backoff`] instead, which stops waiting when it is dropped.
    fn should_retry(
        &self,
        attempts: u32,
        elapsed: Duration,
        allow_sleep: bool,
    ) -> bool {
        if !self.permits(attempts, elapsed) {
            return false;
        }
        if allow_sleep {
            sleep_until(Instant::now() + self.interval());
        }
        true
    }

    /// The decision without any waiting.
    fn permits(&self, attempts: u32, elapsed: Duration) -> bool;

    /// How long to wait between two attempts.
    fn interval(&self) -> Duration;
}

/// Async counterpart of [`RetryPolicy::should_retry`] with sleeping allowed.
/// Dropping the returned future abandons the wait.
pub async fn backoff(
    policy: &dyn RetryPolicy,
    attempts: u32,
    elapsed: Duration,
) -> bool {
    if !policy.permits(attempts, elapsed) {
        return false;
    }
    time::sleep(policy.interval()).await;
    true
}

// thread::sleep may return early on some platforms, so re-check the deadline
// rather than trusting a single call.
fn sleep_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(deadline - now);
    }
}

/// Retries up to a fixed number of times with a fixed interval.
#[derive(Debug, Clone)]
pub struct RetryNTimes {
    times: u32,
    interval: Duration,
}

impl RetryNTimes {
    pub fn new(times: u32, interval: Duration) -> Self {
        Self { times, interval }
    }
}

impl RetryPolicy for RetryNTimes {
    fn permits(&self, attempts: u32, _elapsed: Duration) -> bool {
        attempts < self.times
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Retries until the total time spent exceeds a budget.
#[derive(Debug, Clone)]
pub struct RetryUntilElapsed {
    budget: Duration,
    interval: Duration,
}

impl RetryUntilElapsed {
    pub fn new(budget: Duration, interval: Duration) -> Self {
        Self { budget, interval }
    }
}

impl RetryPolicy for RetryUntilElapsed {
    fn permits(&self, _attempts: u32, elapsed: Duration) -> bool {
        elapsed + self.interval < self.budget
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn permits(&self, _attempts: u32, _elapsed: Duration) -> bool {
        false
    }

    fn interval(&self) -> Duration {
        Duration::ZERO
    }
}
