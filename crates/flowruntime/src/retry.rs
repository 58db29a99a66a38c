use flowcore::{NodeContext, NodeError, NodeExecutable, NodeOutput};
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Exponential backoff between attempts: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay after the failed 0-based `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(5000),
        }
    }
}

/// Run a node up to `max_retries + 1` times, each attempt bounded by
/// `attempt_timeout`.
///
/// A soft failure on the last attempt is returned as `Ok`; a hard failure on
/// the last attempt is returned as `Err`. Cancellation is observed between
/// attempts; an attempt already running is left to finish.
pub async fn execute_with_retries(
    executable: &dyn NodeExecutable,
    ctx: &NodeContext,
    max_retries: u32,
    attempt_timeout: Duration,
    backoff: Backoff,
) -> Result<NodeOutput, NodeError> {
    let attempts = max_retries.saturating_add(1);

    for attempt in 0..attempts {
        if ctx.cancellation.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        let is_last = attempt + 1 == attempts;
        let outcome = match timeout(attempt_timeout, executable.execute(ctx.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => Err(NodeError::Timeout {
                ms: attempt_timeout.as_millis() as u64,
            }),
        };

        let reason = match outcome {
            Ok(output) if output.success => return Ok(output),
            Ok(output) if is_last => return Ok(output),
            Err(err) if is_last => return Err(err),
            Ok(output) => output
                .error
                .unwrap_or_else(|| "node reported failure".to_string()),
            Err(err) => err.to_string(),
        };

        let delay = backoff.delay(attempt);
        tracing::warn!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            "Attempt {}/{} failed: {}. Retrying in {}ms",
            attempt + 1,
            attempts,
            reason,
            delay.as_millis()
        );

        tokio::select! {
            _ = sleep(delay) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }
    }

    // attempts >= 1, so the loop always returns.
    Err(NodeError::ExecutionFailed("no attempts were made".to_string()))
}
