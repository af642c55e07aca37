//! Append-only progress events (`order_events` table).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The reserved order name under which job-level (as opposed to per-order) events are filed.
pub const JOB_ORDER_NAME: &str = "_job";

/// Event kind, modeled as the closed set of kinds this engine actually
/// emits rather than a free-form string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobStarted,
    JobCompleted,
    Dispatched,
    Completed,
    DependencyFailed,
}

/// A single append-only progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub trace_id: String,
    pub order_name: String,
    pub epoch: i64,
    pub event_type: EventType,
    pub status: Option<String>,
    pub log_location: Option<String>,
    pub execution_url: Option<String>,
    pub message: Option<String>,
    pub flow_id: String,
    pub run_id: String,
}

impl OrderEvent {
    /// The documented sort-key prefix `"<order_name>:<epoch_seconds>"`.
    ///
    /// Store implementations append a monotonic tie-breaker to disambiguate
    /// same-second writes; that suffix is a storage detail and not part of
    /// this documented prefix.
    pub fn sort_key_prefix(&self) -> String {
        format!("{}:{}", self.order_name, self.epoch)
    }

    /// Build the `job_started` event emitted once per run by the initiator.
    pub fn job_started(trace_id: &str, run_id: &str, flow_id: &str, order_count: usize, now: DateTime<Utc>) -> Self {
        OrderEvent {
            trace_id: trace_id.to_string(),
            order_name: JOB_ORDER_NAME.to_string(),
            epoch: now.timestamp(),
            event_type: EventType::JobStarted,
            status: Some("running".to_string()),
            log_location: None,
            execution_url: None,
            message: Some(format!("{order_count} orders queued")),
            flow_id: flow_id.to_string(),
            run_id: run_id.to_string(),
        }
    }

    /// Build the `job_completed` event emitted once per run by the controller.
    pub fn job_completed(
        trace_id: &str,
        run_id: &str,
        flow_id: &str,
        status: &str,
        done_endpoint: &str,
        now: DateTime<Utc>,
    ) -> Self {
        OrderEvent {
            trace_id: trace_id.to_string(),
            order_name: JOB_ORDER_NAME.to_string(),
            epoch: now.timestamp(),
            event_type: EventType::JobCompleted,
            status: Some(status.to_string()),
            log_location: Some(done_endpoint.to_string()),
            execution_url: None,
            message: None,
            flow_id: flow_id.to_string(),
            run_id: run_id.to_string(),
        }
    }

    /// Build a `dispatched` event for a single order.
    pub fn dispatched(
        trace_id: &str,
        run_id: &str,
        flow_id: &str,
        order_name: &str,
        execution_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        OrderEvent {
            trace_id: trace_id.to_string(),
            order_name: order_name.to_string(),
            epoch: now.timestamp(),
            event_type: EventType::Dispatched,
            status: Some("running".to_string()),
            log_location: None,
            execution_url: execution_url.map(str::to_string),
            message: None,
            flow_id: flow_id.to_string(),
            run_id: run_id.to_string(),
        }
    }

    /// Build a `completed` event reporting a worker-self-reported or
    /// watchdog-certified terminal status.
    pub fn completed(
        trace_id: &str,
        run_id: &str,
        flow_id: &str,
        order_name: &str,
        status: &str,
        log_location: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        OrderEvent {
            trace_id: trace_id.to_string(),
            order_name: order_name.to_string(),
            epoch: now.timestamp(),
            event_type: EventType::Completed,
            status: Some(status.to_string()),
            log_location: log_location.map(str::to_string),
            execution_url: None,
            message: None,
            flow_id: flow_id.to_string(),
            run_id: run_id.to_string(),
        }
    }

    /// Build a `dependency_failed` cascade event.
    pub fn dependency_failed(
        trace_id: &str,
        run_id: &str,
        flow_id: &str,
        order_name: &str,
        now: DateTime<Utc>,
    ) -> Self {
        OrderEvent {
            trace_id: trace_id.to_string(),
            order_name: order_name.to_string(),
            epoch: now.timestamp(),
            event_type: EventType::DependencyFailed,
            status: Some("failed".to_string()),
            log_location: None,
            execution_url: None,
            message: Some("dependency_failed".to_string()),
            flow_id: flow_id.to_string(),
            run_id: run_id.to_string(),
        }
    }
}
