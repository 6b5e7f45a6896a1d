use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::upstream::{CancelPhase, UpstreamError};

/// Delays between attempts; the number of attempts is `delays.len() + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    // Tuned to Bybit's rate-limit recovery window.
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(360),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn no_retry() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn max_attempts(&self) -> u32 {
        self.delays.len() as u32 + 1
    }
}

pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled {
                operation,
                phase: CancelPhase::Call,
            });
        }

        attempt += 1;
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled {
                operation,
                phase: CancelPhase::Call,
            });
        }

        if attempt >= max_attempts {
            return Err(UpstreamError::RetriesExhausted {
                operation,
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let wait = policy.delays[(attempt - 1) as usize];
        warn!(
            component = "upstream",
            event = "upstream.retry.scheduled",
            operation,
            attempt,
            max_attempts,
            wait_ms = wait.as_millis() as u64,
            error = %err
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(UpstreamError::Cancelled {
                    operation,
                    phase: CancelPhase::Backoff,
                });
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
