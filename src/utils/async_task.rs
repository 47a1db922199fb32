use std::time::Duration;

use rand::Rng;
use tracing::error;

use crate::BackoffPolicy;
use crate::Result;

/// Exponential backoff for the `attempt`-th retry (0-based), capped at
/// `max_delay_ms`, with up to 50% random jitter so that routers refreshing on
/// the same staleness signal do not retry in lockstep.
pub(crate) fn backoff_delay(
    policy: &BackoffPolicy,
    attempt: usize,
) -> Duration {
    if policy.base_delay_ms == 0 {
        return Duration::ZERO;
    }
    let exp = policy
        .base_delay_ms
        .saturating_mul(1u64 << attempt.min(16))
        .min(policy.max_delay_ms.max(policy.base_delay_ms));
    let jitter = rand::thread_rng().gen_range(0..=exp / 2);
    Duration::from_millis(exp - exp / 4 + jitter / 2)
}

// Helper function to spawn tasks and track their JoinHandles
pub(crate) fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
    handles: Option<&mut Vec<tokio::task::JoinHandle<()>>>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    // Clone the name so it can be safely moved into the async block
    let name = name.to_string();
    let handle = tokio::spawn(async move {
        if let Err(e) = task_fn().await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    });

    if let Some(h) = handles {
        h.push(handle);
    }
}
