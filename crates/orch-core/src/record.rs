//! Durable order records (`orders` table).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::order_pk;
use crate::job::{ExecutionTarget, Order};

/// Lifecycle status of an [`OrderRecord`].
///
/// Transitions: `queued -> running -> {succeeded, failed, timed_out}`, plus
/// `queued -> failed` directly when cascading a dependency failure. No
/// other transition is valid; see invariant 2 of the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl OrderStatus {
    /// `true` for the three terminal statuses.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Succeeded | OrderStatus::Failed | OrderStatus::TimedOut)
    }
}

/// The fixed lifetime of an order record: 24 hours from creation.
pub const ORDER_RECORD_TTL_SECONDS: i64 = 86_400;

/// A durable order record, the unit of progress tracking for one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub run_id: String,
    pub order_num: String,
    pub trace_id: String,
    pub flow_id: String,
    pub order_name: String,
    pub cmds: Vec<String>,
    pub status: OrderStatus,
    pub queue_id: String,
    pub execution_target: ExecutionTarget,
    pub s3_location: Option<String>,
    pub callback_url: Option<String>,
    pub watchdog_handle: Option<String>,
    pub execution_handle: Option<String>,
    /// Base64-encoded git-source descriptor, present only when the order
    /// is not object-store-sourced.
    pub git_b64: Option<String>,
    /// Object-store location of the order's prepared execution archive,
    /// populated once the repackager has run.
    pub archive_location: Option<String>,
    /// Secret-store path holding the auto-generated envelope private key,
    /// present only when the repackager generated a keypair rather than
    /// using a caller-supplied recipient key.
    pub envelope_key_ref: Option<String>,
    pub dependencies: Vec<String>,
    pub must_succeed: bool,
    pub timeout: u64,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub ttl: i64,
    pub log: Option<String>,
    pub failure_reason: Option<String>,
}

impl OrderRecord {
    /// Composite primary key `"<run_id>:<order_num>"`.
    pub fn pk(&self) -> String {
        order_pk(&self.run_id, &self.order_num)
    }

    /// Build a freshly-queued record for `order` at the given position.
    #[allow(clippy::too_many_arguments)]
    pub fn new_queued(
        run_id: &str,
        order_num: &str,
        trace_id: &str,
        flow_id: &str,
        index: usize,
        order: &Order,
        s3_location: Option<String>,
        callback_url: Option<String>,
        git_b64: Option<String>,
        archive_location: Option<String>,
        envelope_key_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let order_name = order
            .order_name
            .clone()
            .unwrap_or_else(|| format!("order-{order_num}"));
        OrderRecord {
            run_id: run_id.to_string(),
            order_num: order_num.to_string(),
            trace_id: trace_id.to_string(),
            flow_id: flow_id.to_string(),
            order_name,
            cmds: order.cmds.clone(),
            status: OrderStatus::Queued,
            queue_id: order.effective_queue_id(index),
            execution_target: order.execution_target,
            s3_location,
            callback_url,
            watchdog_handle: None,
            execution_handle: None,
            git_b64,
            archive_location,
            envelope_key_ref,
            dependencies: order.dependencies.clone(),
            must_succeed: order.must_succeed,
            timeout: order.timeout,
            created_at: now,
            last_update: now,
            ttl: now.timestamp() + ORDER_RECORD_TTL_SECONDS,
            log: None,
            failure_reason: None,
        }
    }
}

/// Canonical summary of a run's terminal order statuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl StatusSummary {
    /// Tally the terminal statuses of `records`. Non-terminal records are ignored.
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a OrderRecord>) -> Self {
        let mut summary = StatusSummary::default();
        for record in records {
            match record.status {
                OrderStatus::Succeeded => summary.succeeded += 1,
                OrderStatus::Failed => summary.failed += 1,
                OrderStatus::TimedOut => summary.timed_out += 1,
                OrderStatus::Queued | OrderStatus::Running => {}
            }
        }
        summary
    }
}

/// Overall job status, resolved from a run's terminal order records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Resolve job status from terminal records: `timed_out` > `failed` (when
/// `must_succeed`) > `succeeded`, matching the controller's finalize step.
pub fn resolve_job_status<'a>(records: impl IntoIterator<Item = &'a OrderRecord>) -> JobStatus {
    let mut any_timed_out = false;
    let mut any_failed_must_succeed = false;
    for record in records {
        match record.status {
            OrderStatus::TimedOut => any_timed_out = true,
            OrderStatus::Failed if record.must_succeed => any_failed_must_succeed = true,
            _ => {}
        }
    }
    if any_timed_out {
        JobStatus::TimedOut
    } else if any_failed_must_succeed {
        JobStatus::Failed
    } else {
        JobStatus::Succeeded
    }
}

/// Build a `BTreeMap` of dynamic field updates for a status transition,
/// the shape a key-value-store adapter turns into an update expression.
pub fn status_update_fields(
    status: OrderStatus,
    log: Option<&str>,
    failure_reason: Option<&str>,
    now: DateTime<Utc>,
) -> BTreeMap<String, serde_json::Value> {
    let mut fields = BTreeMap::new();
    fields.insert("status".to_string(), serde_json::to_value(status).unwrap());
    fields.insert("last_update".to_string(), serde_json::to_value(now).unwrap());
    if let Some(log) = log {
        fields.insert("log".to_string(), serde_json::Value::String(log.to_string()));
    }
    if let Some(reason) = failure_reason {
        fields.insert(
            "failure_reason".to_string(),
            serde_json::Value::String(reason.to_string()),
        );
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Order;

    fn sample_order() -> Order {
        serde_json::from_value(serde_json::json!({
            "cmds": ["echo hi"],
            "timeout": 30
        }))
        .unwrap()
    }

    #[test]
    fn pk_format() {
        let now = Utc::now();
        let record = OrderRecord::new_queued(
            "run-1", "0001", "trace1", "flow1", 0, &sample_order(), None, None, None, None, None, now,
        );
        assert_eq!(record.pk(), "run-1:0001");
    }

    #[test]
    fn order_name_defaults_from_order_num() {
        let now = Utc::now();
        let record = OrderRecord::new_queued(
            "run-1", "0002", "trace1", "flow1", 1, &sample_order(), None, None, None, None, None, now,
        );
        assert_eq!(record.order_name, "order-0002");
    }

    #[test]
    fn ttl_is_24_hours_from_creation() {
        let now = Utc::now();
        let record = OrderRecord::new_queued(
            "run-1", "0001", "trace1", "flow1", 0, &sample_order(), None, None, None, None, None, now,
        );
        assert_eq!(record.ttl, now.timestamp() + 86_400);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Succeeded.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::TimedOut.is_terminal());
        assert!(!OrderStatus::Queued.is_terminal());
        assert!(!OrderStatus::Running.is_terminal());
    }

    fn record_with_status(status: OrderStatus, must_succeed: bool) -> OrderRecord {
        let now = Utc::now();
        let mut order = sample_order();
        order.must_succeed = must_succeed;
        let mut record = OrderRecord::new_queued(
            "run-1", "0001", "trace1", "flow1", 0, &order, None, None, None, None, None, now,
        );
        record.status = status;
        record
    }

    #[test]
    fn job_status_timed_out_wins() {
        let records = vec![
            record_with_status(OrderStatus::TimedOut, true),
            record_with_status(OrderStatus::Failed, true),
        ];
        assert_eq!(resolve_job_status(&records), JobStatus::TimedOut);
    }

    #[test]
    fn job_status_failed_requires_must_succeed() {
        let records = vec![record_with_status(OrderStatus::Failed, false)];
        assert_eq!(resolve_job_status(&records), JobStatus::Succeeded);
    }

    #[test]
    fn job_status_failed_when_must_succeed_failed() {
        let records = vec![record_with_status(OrderStatus::Failed, true)];
        assert_eq!(resolve_job_status(&records), JobStatus::Failed);
    }

    #[test]
    fn job_status_succeeded_when_all_succeeded() {
        let records = vec![
            record_with_status(OrderStatus::Succeeded, true),
            record_with_status(OrderStatus::Succeeded, false),
        ];
        assert_eq!(resolve_job_status(&records), JobStatus::Succeeded);
    }

    #[test]
    fn summary_tally() {
        let records = vec![
            record_with_status(OrderStatus::Succeeded, true),
            record_with_status(OrderStatus::Failed, true),
            record_with_status(OrderStatus::TimedOut, true),
            record_with_status(OrderStatus::Queued, true),
        ];
        let summary = StatusSummary::tally(&records);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
    }
}
