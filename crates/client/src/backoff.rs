//! Exponential backoff driver: run an attempt until it reports done, sleeping
//! between attempts, for at most `steps` attempts.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Backoff schedule. No jitter: delays are `initial * factor^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    /// Maximum number of attempts.
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_millis(500), factor: 2, steps: 4 }
    }
}

impl Backoff {
    /// Sleeps taken between consecutive attempts (`steps - 1` of them).
    pub fn delays(&self) -> Vec<Duration> {
        let mut out = Vec::new();
        let mut delay = self.initial;
        for _ in 1..self.steps.max(1) {
            out.push(delay);
            delay = delay.saturating_mul(self.factor);
        }
        out
    }
}

/// Outcome of a single attempt. A failed attempt is never fatal to the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Done,
    Retry(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    Exhausted { attempts: u32, last: String },
    Cancelled { attempts: u32 },
}

/// Drive `attempt` (called with the 1-based attempt number) under `backoff`.
/// Returns the number of attempts used on success. Cancellation is observed
/// only between attempts, so an attempt in progress always finishes.
pub async fn retry<F, Fut>(backoff: Backoff, cancel: &CancellationToken, mut attempt: F) -> Result<u32, BackoffError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt>,
{
    let delays = backoff.delays();
    let steps = delays.len() as u32 + 1;
    let mut last = String::new();
    for n in 1..=steps {
        match attempt(n).await {
            Attempt::Done => return Ok(n),
            Attempt::Retry(reason) => last = reason,
        }
        let Some(delay) = delays.get(n as usize - 1) else { break };
        tokio::select! {
            _ = cancel.cancelled() => return Err(BackoffError::Cancelled { attempts: n }),
            _ = tokio::time::sleep(*delay) => {}
        }
    }
    Err(BackoffError::Exhausted { attempts: steps, last })
}
