//! The Watchdog: a per-order liveness check, invoked on its own schedule
//! by the process the dispatcher recorded as `watchdog_handle`. Certifies
//! a timeout by synthesizing the same callback shape a worker would have
//! written, so the controller's reconciliation step never needs to know
//! whether a result came from a worker or a timeout.

use chrono::{DateTime, Duration, Utc};
use orch_store::ObjectStore;

/// Errors `watchdog_tick` can return.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] orch_store::StoreError),
}

impl From<WatchdogError> for orch_error::OrchError {
    fn from(err: WatchdogError) -> Self {
        match err {
            WatchdogError::Store(e) => e.into(),
        }
    }
}

/// The result of one watchdog tick against a single order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The order's callback already exists, or the watchdog just wrote a
    /// synthetic timeout one; either way the order is settled.
    Done,
    /// Neither a callback nor a timeout exists yet; keep polling.
    Pending,
}

/// Check one order's callback object, writing a synthetic `timed_out`
/// callback if `start_time + timeout_secs` has elapsed.
pub async fn watchdog_tick<O: ObjectStore>(
    object_store: &O,
    run_id: &str,
    order_num: &str,
    timeout_secs: u64,
    start_time: DateTime<Utc>,
) -> Result<WatchdogOutcome, WatchdogError> {
    let callback_path = format!("tmp/callbacks/runs/{run_id}/{order_num}/result.json");
    if object_store.head_object(&callback_path).await? {
        return Ok(WatchdogOutcome::Done);
    }

    let deadline = start_time + Duration::seconds(timeout_secs as i64);
    if Utc::now() <= deadline {
        return Ok(WatchdogOutcome::Pending);
    }

    let body = serde_json::json!({
        "status": "timed_out",
        "log": format!("watchdog: order {order_num} exceeded its {timeout_secs}s timeout"),
    })
    .to_string()
    .into_bytes();
    object_store.put_object(&callback_path, body).await?;
    Ok(WatchdogOutcome::Done)
}
