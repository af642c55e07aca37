//! The Controller: a single, lock-mediated pass over a run's order
//! records. Triggered externally by every worker/watchdog callback write
//! (and the initiator's own init trigger); idempotent and safe to invoke
//! concurrently, since only the lock holder mutates state.

use chrono::Utc;

use orch_core::{status_update_fields, JobStatus, OrderEvent, OrderStatus, StatusSummary};
use orch_dispatch::{dispatch_ready, BackendRegistry};
use orch_store::{KeyValueStore, LockAcquireOutcome, ObjectStore, StoreError};
use orch_telemetry::RunMetrics;

/// Errors `run_controller` can return. Any error here is preceded by a
/// best-effort lock release.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ControllerError> for orch_error::OrchError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::Store(e) => e.into(),
        }
    }
}

/// The result of one controller invocation.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControllerOutcome {
    /// Another invocation already holds the run's lock; this one did nothing.
    Skipped,
    /// Progress was made (reconciliation, cascades, and/or dispatch), but
    /// the run is not yet complete.
    InProgress,
    /// Every order reached a terminal status; the run's "done" artifact was written.
    Finalized {
        /// The resolved overall job status.
        job_status: JobStatus,
        /// Terminal-status tally across the run's orders.
        summary: StatusSummary,
    },
    /// The trigger key referenced a run with no order records (already
    /// finalized and reaped, or a malformed trigger).
    NoOrders,
}

/// Extract `run_id` from a callback trigger key of the shape
/// `tmp/callbacks/runs/<run_id>/<order_num>/result.json`.
pub fn parse_run_id_from_trigger(trigger_key: &str) -> Option<&str> {
    let rest = trigger_key.strip_prefix("tmp/callbacks/runs/")?;
    let (run_id, _) = rest.split_once('/')?;
    if run_id.is_empty() { None } else { Some(run_id) }
}

/// Run one controller pass for the run named in `trigger_key`.
pub async fn run_controller<KV, O>(
    trigger_key: &str,
    cfg: &orch_config::OrchConfig,
    kv: &KV,
    object_store: &O,
    registry: &BackendRegistry,
) -> Result<(ControllerOutcome, RunMetrics), ControllerError>
where
    KV: KeyValueStore,
    O: ObjectStore,
{
    let start = std::time::Instant::now();
    let run_id = parse_run_id_from_trigger(trigger_key)
        .ok_or_else(|| ControllerError::Store(StoreError::Internal(format!("unparseable trigger key: {trigger_key}"))))?
        .to_string();

    let mut metrics = RunMetrics { run_id: run_id.clone(), ..Default::default() };

    let records = kv.get_all_orders(&run_id).await?;
    if records.is_empty() {
        metrics.duration_ms = start.elapsed().as_millis() as u64;
        return Ok((ControllerOutcome::NoOrders, metrics));
    }
    let flow_id = records[0].flow_id.clone();
    let trace_id = records[0].trace_id.clone();

    let lock = match kv.acquire_lock(&run_id, &flow_id, &trace_id).await? {
        LockAcquireOutcome::Acquired(lock) => lock,
        LockAcquireOutcome::Contended => {
            metrics.skipped = true;
            metrics.duration_ms = start.elapsed().as_millis() as u64;
            return Ok((ControllerOutcome::Skipped, metrics));
        }
    };

    let result = advance_run(&run_id, &flow_id, &trace_id, cfg, kv, object_store, registry, &mut metrics).await;

    // Release the lock regardless of outcome: a finalized run releases it as
    // part of completing, an in-progress run releases it so the next
    // callback can take over, and an error releases it so a stuck holder
    // never blocks subsequent passes.
    let release_result = kv.release_lock(&run_id, &lock.orchestrator_id).await;

    match result {
        Ok(outcome) => {
            release_result?;
            metrics.finalized = matches!(outcome, ControllerOutcome::Finalized { .. });
            metrics.duration_ms = start.elapsed().as_millis() as u64;
            Ok((outcome, metrics))
        }
        Err(err) => {
            let _ = release_result;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn advance_run<KV, O>(
    run_id: &str,
    flow_id: &str,
    trace_id: &str,
    cfg: &orch_config::OrchConfig,
    kv: &KV,
    object_store: &O,
    registry: &BackendRegistry,
    metrics: &mut RunMetrics,
) -> Result<ControllerOutcome, ControllerError>
where
    KV: KeyValueStore,
    O: ObjectStore,
{
    // Step 2: reconcile every `running` order against its callback object.
    let records = kv.get_all_orders(run_id).await?;
    for record in records.iter().filter(|r| r.status == OrderStatus::Running) {
        let callback_path = format!("tmp/callbacks/runs/{run_id}/{}/result.json", record.order_num);
        let Some(body) = object_store.get_object(&callback_path).await? else { continue };
        let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&body) else { continue };
        let status_str = parsed.get("status").and_then(|v| v.as_str()).unwrap_or("failed").to_string();
        let log = parsed.get("log").and_then(|v| v.as_str());
        let status = match status_str.as_str() {
            "succeeded" => OrderStatus::Succeeded,
            "timed_out" => OrderStatus::TimedOut,
            _ => OrderStatus::Failed,
        };
        let now = Utc::now();
        let fields = status_update_fields(status, log, None, now);
        kv.update_order_status(&record.pk(), fields).await?;
        kv.put_event(OrderEvent::completed(trace_id, run_id, flow_id, &record.order_name, &status_str, Some(&callback_path), now))
            .await?;
    }

    // Step 3: re-read reconciled state and classify queued orders.
    let records = kv.get_all_orders(run_id).await?;
    let evaluation = orch_evaluator::evaluate(&records);

    // Step 4: cascade dependency failures.
    for order in &evaluation.cascade_failed {
        let now = Utc::now();
        let fields = status_update_fields(OrderStatus::Failed, None, Some("dependency_failed"), now);
        kv.update_order_status(&order.pk(), fields).await?;
        kv.put_event(OrderEvent::dependency_failed(trace_id, run_id, flow_id, &order.order_name, now)).await?;
        metrics.cascade_failed_count += 1;
    }

    // Step 5: dispatch every ready order under the configured concurrency bound.
    let outcomes = dispatch_ready(&evaluation.ready, registry, kv, cfg.backend_watchdog_handle.as_deref(), cfg.dispatch_concurrency).await;
    metrics.dispatched_count += outcomes.iter().filter(|o| o.dispatched).count() as u64;

    // Step 6/7: finalize if every order reached a terminal status, else leave in progress.
    let final_records = kv.get_all_orders(run_id).await?;
    if final_records.iter().all(|r| r.status.is_terminal()) {
        let job_status = orch_core::resolve_job_status(&final_records);
        let summary = StatusSummary::tally(&final_records);
        let status_str = match job_status {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        };
        let now = Utc::now();
        let done_endpoint = format!("{}/{run_id}/done", cfg.done_bucket);
        kv.put_event(OrderEvent::job_completed(trace_id, run_id, flow_id, status_str, &done_endpoint, now)).await?;
        let body = serde_json::json!({ "status": status_str, "summary": summary }).to_string().into_bytes();
        object_store.put_object(&format!("{}/{run_id}/done", cfg.done_bucket), body).await?;
        Ok(ControllerOutcome::Finalized { job_status, summary })
    } else {
        Ok(ControllerOutcome::InProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_core::Job;
    use orch_store::{FileObjectStore, InMemoryKeyValueStore, InMemorySecretStore};
    use std::sync::Arc;

    fn order_json(extra: serde_json::Value) -> orch_core::Order {
        let mut base = serde_json::json!({ "cmds": ["echo hi"], "timeout": 30 });
        if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                base_obj.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).unwrap()
    }

    fn sample_job(orders: Vec<orch_core::Order>) -> Job {
        Job {
            username: "alice".into(),
            git_repo: None,
            git_token_location: None,
            git_ssh_key_location: None,
            commit_hash: None,
            orders,
            pr_number: None,
            issue_number: None,
            pr_comment_search_tag: None,
            presign_expiry: 7200,
            job_timeout: 3600,
            flow_label: "exec".into(),
        }
    }

    fn cfg() -> orch_config::OrchConfig {
        let mut cfg = orch_config::OrchConfig::default();
        cfg.internal_bucket = "internal".into();
        cfg.done_bucket = "done".into();
        cfg
    }

    #[test]
    fn parse_run_id_from_trigger_extracts_run_id() {
        assert_eq!(parse_run_id_from_trigger("tmp/callbacks/runs/run-123/0001/result.json"), Some("run-123"));
        assert_eq!(parse_run_id_from_trigger("garbage"), None);
    }

    #[tokio::test]
    async fn no_orders_yields_no_orders_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(FileObjectStore::new(dir.path().join("objects")).unwrap());
        let kv = InMemoryKeyValueStore::new();
        let registry = BackendRegistry::all_mock(object_store.clone());
        let (outcome, _) = run_controller("tmp/callbacks/runs/missing-run/0000/result.json", &cfg(), &kv, object_store.as_ref(), &registry)
            .await
            .unwrap();
        assert_eq!(outcome, ControllerOutcome::NoOrders);
    }

    #[tokio::test]
    async fn chained_success_scenario_finalizes_within_a_few_passes() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(FileObjectStore::new(dir.path().join("objects")).unwrap());
        object_store.put_object("uploads/a.tar", b"a".to_vec()).await.unwrap();
        object_store.put_object("uploads/b.tar", b"b".to_vec()).await.unwrap();
        object_store.put_object("uploads/c.tar", b"c".to_vec()).await.unwrap();
        let secret_store = InMemorySecretStore::new();
        let kv = InMemoryKeyValueStore::new();

        let job = sample_job(vec![
            order_json(serde_json::json!({ "s3_location": "uploads/a.tar", "queue_id": "0001" })),
            order_json(serde_json::json!({ "s3_location": "uploads/b.tar", "queue_id": "0002" })),
            order_json(serde_json::json!({
                "s3_location": "uploads/c.tar",
                "queue_id": "0003",
                "dependencies": ["0001", "0002"],
            })),
        ]);
        let job_b64 = job.to_b64().unwrap();
        let config = cfg();
        let outcome = crate::initiator::submit(&job_b64, &config, &kv, object_store.as_ref(), &secret_store, &dir.path().join("work"))
            .await
            .unwrap();

        let registry = BackendRegistry::all_mock(object_store.clone());
        let trigger_key = format!("tmp/callbacks/runs/{}/0000/result.json", outcome.run_id);

        let mut finalized = None;
        for _ in 0..6 {
            let (result, _metrics) = run_controller(&trigger_key, &config, &kv, object_store.as_ref(), &registry).await.unwrap();
            if let ControllerOutcome::Finalized { job_status, summary } = result {
                finalized = Some((job_status, summary));
                break;
            }
        }
        let (job_status, summary) = finalized.expect("run should finalize within a bounded number of passes");
        assert_eq!(job_status, JobStatus::Succeeded);
        assert_eq!(summary.succeeded, 3);
        assert!(object_store.head_object(&format!("done/{}/done", outcome.run_id)).await.unwrap());
    }

    #[tokio::test]
    async fn lock_contention_skips_the_second_caller() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(FileObjectStore::new(dir.path().join("objects")).unwrap());
        object_store.put_object("uploads/a.tar", b"a".to_vec()).await.unwrap();
        let secret_store = InMemorySecretStore::new();
        let kv = InMemoryKeyValueStore::new();

        let job = sample_job(vec![order_json(serde_json::json!({ "s3_location": "uploads/a.tar" }))]);
        let job_b64 = job.to_b64().unwrap();
        let config = cfg();
        let outcome = crate::initiator::submit(&job_b64, &config, &kv, object_store.as_ref(), &secret_store, &dir.path().join("work"))
            .await
            .unwrap();

        kv.acquire_lock(&outcome.run_id, &outcome.flow_id, &outcome.trace_id).await.unwrap();

        let registry = BackendRegistry::all_mock(object_store.clone());
        let trigger_key = format!("tmp/callbacks/runs/{}/0000/result.json", outcome.run_id);
        let (result, metrics) = run_controller(&trigger_key, &config, &kv, object_store.as_ref(), &registry).await.unwrap();
        assert_eq!(result, ControllerOutcome::Skipped);
        assert!(metrics.skipped);
    }
}
