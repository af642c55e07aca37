// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! orch-dispatch
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use orch_core::{ExecutionTarget, OrderEvent, OrderRecord, OrderStatus};
use orch_store::{KeyValueStore, ObjectStore, StoreError};

/// Errors a [`Backend`] can report for a single dispatch attempt.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The selected back-end has no configured handle identifier.
    #[error("back-end '{backend}' has no configured handle")]
    Unconfigured {
        /// The back-end name (`function`, `build`, `agent`).
        backend: &'static str,
    },
    /// Writing the mock back-end's synthetic callback failed.
    #[error("callback write failed: {0}")]
    Store(#[from] StoreError),
}

impl From<DispatchError> for orch_error::OrchError {
    fn from(err: DispatchError) -> Self {
        orch_error::OrchError::new(orch_error::ErrorCode::DispatchFailed, err.to_string()).with_source(err)
    }
}

/// Everything a [`Backend`] needs to dispatch one order.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// The run this order belongs to.
    pub run_id: String,
    /// The order's zero-padded position.
    pub order_num: String,
    /// The order's human-readable name.
    pub order_name: String,
    /// Object-store location of the order's prepared execution archive.
    pub archive_location: Option<String>,
    /// Secret-store path holding the auto-generated envelope private key, if any.
    pub envelope_key_ref: Option<String>,
}

impl DispatchRequest {
    fn from_record(record: &OrderRecord) -> Self {
        DispatchRequest {
            run_id: record.run_id.clone(),
            order_num: record.order_num.clone(),
            order_name: record.order_name.clone(),
            archive_location: record.archive_location.clone(),
            envelope_key_ref: record.envelope_key_ref.clone(),
        }
    }
}

/// An opaque handle a back-end returns for a dispatched order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle(pub String);

/// A back-end capable of running one order.
///
/// Three named implementations (`function`, `build`, `agent`) stand in for
/// the out-of-scope real execution back-ends: each constructs a
/// deterministic handle from its configured identifier, the shape a
/// deployer wires a real client behind. A fourth `mock` back-end always
/// succeeds immediately and synthesizes its own callback write, letting the
/// controller loop run end-to-end with no real back-end registered.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The back-end's name, for logging and error messages.
    fn name(&self) -> &'static str;
    /// Dispatch `request`, returning an opaque execution handle.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<ExecutionHandle, DispatchError>;
}

/// A named back-end that constructs a deterministic handle from a
/// configured identifier.
pub struct ConfiguredBackend {
    name: &'static str,
    handle: Option<String>,
}

#[async_trait]
impl Backend for ConfiguredBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<ExecutionHandle, DispatchError> {
        let handle = self.handle.as_deref().ok_or(DispatchError::Unconfigured { backend: self.name })?;
        Ok(ExecutionHandle(format!("{handle}:{}:{}", request.run_id, request.order_num)))
    }
}

/// Build the `function` back-end from its configured handle identifier.
pub fn function_backend(handle: Option<String>) -> ConfiguredBackend {
    ConfiguredBackend { name: "function", handle }
}

/// Build the `build` back-end from its configured handle identifier.
pub fn build_backend(handle: Option<String>) -> ConfiguredBackend {
    ConfiguredBackend { name: "build", handle }
}

/// Build the `agent` back-end from its configured handle identifier.
pub fn agent_backend(handle: Option<String>) -> ConfiguredBackend {
    ConfiguredBackend { name: "agent", handle }
}

/// A deterministic, always-succeeding back-end for local testing.
///
/// Performs no real dispatch at all; it just writes the terminal callback a
/// real back-end's worker would eventually write, so the controller loop
/// can be exercised end-to-end with no backend integration.
pub struct MockBackend<O: ObjectStore> {
    object_store: Arc<O>,
}

impl<O: ObjectStore> MockBackend<O> {
    /// Wrap `object_store`, used to synthesize the callback write.
    pub fn new(object_store: Arc<O>) -> Self {
        Self { object_store }
    }
}

#[async_trait]
impl<O: ObjectStore> Backend for MockBackend<O> {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<ExecutionHandle, DispatchError> {
        let path = format!("tmp/callbacks/runs/{}/{}/result.json", request.run_id, request.order_num);
        let body = serde_json::json!({ "status": "succeeded", "log": "mock backend" })
            .to_string()
            .into_bytes();
        self.object_store.put_object(&path, body).await?;
        Ok(ExecutionHandle(format!("mock:{}:{}", request.run_id, request.order_num)))
    }
}

/// Build the `watchdog_handle` recorded on a dispatched order.
///
/// The real watchdog runs as its own short-lived process; dispatch's
/// job is only to hand it a stable reference. `configured` is
/// `OrchConfig::backend_watchdog_handle`; absent, a fixed fallback name is used.
pub fn build_watchdog_handle(configured: Option<&str>, run_id: &str, order_num: &str) -> String {
    let base = configured.unwrap_or("watchdog");
    format!("{base}:{run_id}:{order_num}")
}

/// A fixed set of back-ends, one per [`ExecutionTarget`].
pub struct BackendRegistry {
    function: Box<dyn Backend>,
    build: Box<dyn Backend>,
    agent: Box<dyn Backend>,
}

impl BackendRegistry {
    /// Build a registry from three named back-ends.
    pub fn new(function: Box<dyn Backend>, build: Box<dyn Backend>, agent: Box<dyn Backend>) -> Self {
        Self { function, build, agent }
    }

    /// Build a registry that routes every `execution_target` to the `mock` back-end.
    pub fn all_mock<O: ObjectStore + 'static>(object_store: Arc<O>) -> Self {
        Self::new(
            Box::new(MockBackend::new(object_store.clone())),
            Box::new(MockBackend::new(object_store.clone())),
            Box::new(MockBackend::new(object_store)),
        )
    }

    /// Select the back-end for `target`.
    pub fn select(&self, target: ExecutionTarget) -> &dyn Backend {
        match target {
            ExecutionTarget::Function => self.function.as_ref(),
            ExecutionTarget::Build => self.build.as_ref(),
            ExecutionTarget::Agent => self.agent.as_ref(),
        }
    }
}

/// The outcome of dispatching a single `ready` order.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// The order's zero-padded position.
    pub order_num: String,
    /// `true` iff the back-end accepted the dispatch and the record was updated.
    pub dispatched: bool,
    /// The failure, if dispatch or the follow-up store write failed.
    pub error: Option<DispatchError>,
}

/// Dispatch every `ready` order with a bounded worker pool (`bound =
/// min(ready, concurrency_bound)`).
///
/// A single order's dispatch failure does not block the others: it is
/// logged and the order is left `queued` for the next controller pass to
/// retry. On success, the record transitions to `running` carrying the
/// execution and watchdog handles, and a `dispatched` event is appended.
pub async fn dispatch_ready<KV: KeyValueStore>(
    ready: &[&OrderRecord],
    registry: &BackendRegistry,
    kv: &KV,
    watchdog_handle_base: Option<&str>,
    concurrency_bound: usize,
) -> Vec<DispatchOutcome> {
    use futures::stream::{self, StreamExt};

    if ready.is_empty() {
        return Vec::new();
    }
    let bound = concurrency_bound.min(ready.len()).max(1);
    stream::iter(ready.iter().copied())
        .map(|record| dispatch_one(record, registry, kv, watchdog_handle_base))
        .buffer_unordered(bound)
        .collect()
        .await
}

async fn dispatch_one<KV: KeyValueStore>(
    record: &OrderRecord,
    registry: &BackendRegistry,
    kv: &KV,
    watchdog_handle_base: Option<&str>,
) -> DispatchOutcome {
    let request = DispatchRequest::from_record(record);
    let backend = registry.select(record.execution_target);

    let handle = match backend.dispatch(&request).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!(
                target: "orch.dispatcher",
                order_num = %record.order_num,
                backend = backend.name(),
                error = %err,
                "dispatch failed, leaving order queued for retry"
            );
            return DispatchOutcome { order_num: record.order_num.clone(), dispatched: false, error: Some(err) };
        }
    };

    let now = Utc::now();
    let watchdog_handle = build_watchdog_handle(watchdog_handle_base, &record.run_id, &record.order_num);
    let mut updated = record.clone();
    updated.status = OrderStatus::Running;
    updated.execution_handle = Some(handle.0.clone());
    updated.watchdog_handle = Some(watchdog_handle);
    updated.last_update = now;

    if let Err(err) = kv.put_order(updated).await {
        tracing::warn!(
            target: "orch.dispatcher",
            order_num = %record.order_num,
            error = %err,
            "dispatched but failed to persist the running transition"
        );
        return DispatchOutcome {
            order_num: record.order_num.clone(),
            dispatched: false,
            error: Some(DispatchError::Store(err)),
        };
    }

    let event = OrderEvent::dispatched(&record.trace_id, &record.run_id, &record.flow_id, &record.order_name, Some(&handle.0), now);
    if let Err(err) = kv.put_event(event).await {
        tracing::warn!(target: "orch.dispatcher", order_num = %record.order_num, error = %err, "failed to append dispatched event");
    }

    DispatchOutcome { order_num: record.order_num.clone(), dispatched: true, error: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_core::ExecutionTarget;
    use orch_store::{FileObjectStore, InMemoryKeyValueStore};

    fn sample_record(run_id: &str, order_num: &str, target: ExecutionTarget) -> OrderRecord {
        let now = Utc::now();
        OrderRecord {
            run_id: run_id.to_string(),
            order_num: order_num.to_string(),
            trace_id: "trace1".into(),
            flow_id: "flow1".into(),
            order_name: format!("order-{order_num}"),
            cmds: vec!["echo hi".into()],
            status: OrderStatus::Queued,
            queue_id: order_num.to_string(),
            execution_target: target,
            s3_location: None,
            callback_url: None,
            watchdog_handle: None,
            execution_handle: None,
            git_b64: None,
            archive_location: Some(format!("tmp/exec/{run_id}/{order_num}/exec.zip")),
            envelope_key_ref: None,
            dependencies: vec![],
            must_succeed: true,
            timeout: 60,
            created_at: now,
            last_update: now,
            ttl: now.timestamp() + 86_400,
            log: None,
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn configured_backend_produces_deterministic_handle() {
        let backend = function_backend(Some("fn-handle-1".into()));
        let request = DispatchRequest {
            run_id: "run-1".into(),
            order_num: "0001".into(),
            order_name: "order-0001".into(),
            archive_location: None,
            envelope_key_ref: None,
        };
        let handle = backend.dispatch(&request).await.unwrap();
        assert_eq!(handle.0, "fn-handle-1:run-1:0001");
    }

    #[tokio::test]
    async fn unconfigured_backend_fails() {
        let backend = build_backend(None);
        let request = DispatchRequest {
            run_id: "run-1".into(),
            order_num: "0001".into(),
            order_name: "order-0001".into(),
            archive_location: None,
            envelope_key_ref: None,
        };
        let err = backend.dispatch(&request).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unconfigured { backend: "build" }));
    }

    #[test]
    fn watchdog_handle_falls_back_without_config() {
        assert_eq!(build_watchdog_handle(None, "run-1", "0001"), "watchdog:run-1:0001");
        assert_eq!(build_watchdog_handle(Some("sfn-abc"), "run-1", "0001"), "sfn-abc:run-1:0001");
    }

    #[tokio::test]
    async fn mock_backend_writes_succeeded_callback() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(FileObjectStore::new(dir.path()).unwrap());
        let backend = MockBackend::new(object_store.clone());
        let request = DispatchRequest {
            run_id: "run-1".into(),
            order_num: "0001".into(),
            order_name: "order-0001".into(),
            archive_location: None,
            envelope_key_ref: None,
        };
        backend.dispatch(&request).await.unwrap();
        let body = object_store.get_object("tmp/callbacks/runs/run-1/0001/result.json").await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "succeeded");
    }

    #[tokio::test]
    async fn dispatch_ready_transitions_records_to_running() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(FileObjectStore::new(dir.path()).unwrap());
        let kv = InMemoryKeyValueStore::new();
        let record = sample_record("run-1", "0001", ExecutionTarget::Build);
        kv.put_order(record.clone()).await.unwrap();

        let registry = BackendRegistry::all_mock(object_store);
        let outcomes = dispatch_ready(&[&record], &registry, &kv, Some("sfn-1"), 10).await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].dispatched);
        let fetched = kv.get_order(&record.pk()).await.unwrap().unwrap();
        assert_eq!(fetched.status, OrderStatus::Running);
        assert_eq!(fetched.watchdog_handle.as_deref(), Some("sfn-1:run-1:0001"));
        assert!(fetched.execution_handle.is_some());

        let events = kv.get_events("trace1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, orch_core::EventType::Dispatched);
    }

    #[tokio::test]
    async fn dispatch_failure_leaves_order_queued() {
        let kv = InMemoryKeyValueStore::new();
        let record = sample_record("run-1", "0001", ExecutionTarget::Function);
        kv.put_order(record.clone()).await.unwrap();

        let registry = BackendRegistry::new(Box::new(function_backend(None)), Box::new(build_backend(None)), Box::new(agent_backend(None)));
        let outcomes = dispatch_ready(&[&record], &registry, &kv, None, 10).await;

        assert!(!outcomes[0].dispatched);
        assert!(outcomes[0].error.is_some());
        let fetched = kv.get_order(&record.pk()).await.unwrap().unwrap();
        assert_eq!(fetched.status, OrderStatus::Queued);
    }

    #[tokio::test]
    async fn dispatch_ready_is_empty_for_no_orders() {
        let kv = InMemoryKeyValueStore::new();
        let registry = BackendRegistry::new(Box::new(function_backend(None)), Box::new(build_backend(None)), Box::new(agent_backend(None)));
        let outcomes = dispatch_ready(&[], &registry, &kv, None, 10).await;
        assert!(outcomes.is_empty());
    }
}
