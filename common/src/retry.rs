use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// Delay schedule applied between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base, 2*base, 4*base, ...` for `retries` retries.
    Exponential { base: Duration, retries: u32 },
    /// `base, 2*base, 3*base, ...` for `retries` retries.
    Linear { base: Duration, retries: u32 },
}

impl Backoff {
    /// Coordinator → worker dial: 1s, 2s, 4s, 8s, 16s.
    pub const fn dial() -> Self {
        Backoff::Exponential {
            base: Duration::from_secs(1),
            retries: 5,
        }
    }

    pub fn retries(&self) -> u32 {
        match *self {
            Backoff::Exponential { retries, .. } | Backoff::Linear { retries, .. } => retries,
        }
    }

    /// Delay slept before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Exponential { base, .. } => base * 2u32.saturating_pow(retry.saturating_sub(1)),
            Backoff::Linear { base, .. } => base * retry,
        }
    }

    pub fn delays(&self) -> Vec<Duration> {
        (1..=self.retries()).map(|r| self.delay(r)).collect()
    }
}

/// Runs `op` until it succeeds or the schedule is exhausted, then surfaces the
/// last error. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(backoff: Backoff, target: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt <= backoff.retries() => {
                let delay = backoff.delay(attempt);
                warn!("connection attempt {} to {} failed: {}", attempt, target, e);
                info!("retrying connection to {} in {:?}", target, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
