//! Bounded-exponential-backoff retry wrapper for store-adapter calls.

use std::future::Future;
use std::time::Duration;

use orch_config::RetryPolicy;
use rand::Rng;

use crate::error::StoreError;

/// Retry `op` according to `policy`, retrying only while the returned error
/// is transient: throttling is retried; hard errors propagate immediately.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    let mut delay_ms = policy.base_delay_ms;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                tracing::warn!(
                    target: "orch.store.retry",
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms,
                    "retrying transient store error: {err}"
                );
                let jittered = jittered_delay_ms(delay_ms, policy.jitter_fraction);
                tokio::time::sleep(Duration::from_millis(jittered)).await;
                delay_ms = (delay_ms * 2).min(policy.max_delay_ms);
            }
            Err(err) => return Err(err),
        }
    }
}

fn jittered_delay_ms(base_ms: u64, jitter_fraction: f64) -> u64 {
    let factor = 1.0 + (rand::rng().random::<f64>() * 2.0 - 1.0) * jitter_fraction;
    ((base_ms as f64) * factor).max(0.0).round() as u64
}
