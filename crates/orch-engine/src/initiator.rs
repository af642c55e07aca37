//! The Initiator: decodes a submitted job, validates it fail-fast,
//! repackages its orders into encrypted execution archives, and writes the
//! queued order records and job-started event that seed a run.

use chrono::Utc;

use base64::Engine as _;
use orch_core::{ExecutionTarget, Job, JobCodecError, OrderEvent, OrderRecord};
use orch_store::{ObjectStore, SecretStore};

/// One validation failure, carrying the stable machine-readable code a
/// caller can branch on plus a human-readable reason.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    /// The stable error code.
    pub code: orch_error::ErrorCode,
    /// A human-readable explanation, naming the offending order when applicable.
    pub message: String,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

/// Errors `submit` can return.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The submitted `job_b64` payload did not decode.
    #[error("failed to decode submitted job: {0}")]
    Codec(#[from] JobCodecError),
    /// The job failed validation (fail on first error).
    #[error("job validation failed: {0}")]
    Validation(ValidationFailure),
    /// Repackaging (cloning, encrypting, archiving) failed.
    #[error("repackaging failed: {0}")]
    Repackage(#[from] orch_repackager::RepackagerError),
    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] orch_store::StoreError),
    /// Reading a freshly-written archive back off disk for upload failed.
    #[error("failed to read prepared archive: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SubmitError> for orch_error::OrchError {
    fn from(err: SubmitError) -> Self {
        use orch_error::{ErrorCode, OrchError};
        match err {
            SubmitError::Codec(e) => OrchError::new(ErrorCode::ValidationMalformedPayload, e.to_string()),
            SubmitError::Validation(failure) => OrchError::new(failure.code, failure.message),
            SubmitError::Repackage(e) => e.into(),
            SubmitError::Store(e) => e.into(),
            SubmitError::Io(e) => OrchError::new(ErrorCode::Internal, e.to_string()),
        }
    }
}

/// Identifiers minted for a newly-submitted run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitOutcome {
    /// The generated run identifier.
    pub run_id: String,
    /// The generated trace identifier.
    pub trace_id: String,
    /// The derived flow identifier (`username:trace-label`).
    pub flow_id: String,
    /// Where the controller will look for the terminal "done" artifact.
    pub done_endpoint: String,
    /// PR-comment correlation tag (caller-supplied, or freshly generated).
    pub search_tag: String,
}

/// Validate a job's orders. Stops at the first failure rather than
/// collecting every problem in the job.
pub fn validate_job(job: &Job) -> Result<(), ValidationFailure> {
    use orch_error::ErrorCode;

    if job.orders.is_empty() {
        return Err(ValidationFailure { code: ErrorCode::ValidationEmptyOrders, message: "job has no orders".to_string() });
    }
    for (index, order) in job.orders.iter().enumerate() {
        if order.cmds.is_empty() {
            return Err(ValidationFailure {
                code: ErrorCode::ValidationEmptyCmds,
                message: format!("order {index} has no commands"),
            });
        }
        if order.timeout == 0 {
            return Err(ValidationFailure {
                code: ErrorCode::ValidationBadTimeout,
                message: format!("order {index} timeout must be greater than zero"),
            });
        }
        if order.execution_target == ExecutionTarget::Agent {
            let has_targets = order.ssm_targets.as_ref().is_some_and(|targets| !targets.is_empty());
            if !has_targets {
                return Err(ValidationFailure {
                    code: ErrorCode::ValidationMissingSsmTargets,
                    message: format!("order {index} targets the agent backend but has no ssm_targets"),
                });
            }
        }
        let has_code_source = order.is_s3_sourced() || order.resolved_git_repo(job).is_some();
        if !has_code_source {
            return Err(ValidationFailure {
                code: ErrorCode::ValidationMissingCodeSource,
                message: format!("order {index} has neither an s3_location nor a resolvable git repo"),
            });
        }
    }
    Ok(())
}

fn git_descriptor(job: &Job, order: &orch_core::Order) -> Option<String> {
    let repo = order.resolved_git_repo(job)?;
    let descriptor = serde_json::json!({
        "repo": repo,
        "commit": order.resolved_commit_hash(job),
        "folder": order.git_folder,
    });
    Some(base64::engine::general_purpose::STANDARD.encode(descriptor.to_string()))
}

/// Decode, validate, repackage, and queue a submitted job.
///
/// Returns the identifiers minted for the new run. Callers drive the
/// controller by writing a trigger key under
/// `tmp/callbacks/runs/<run_id>/0000/result.json` (already done here as the
/// final step) or by reacting to worker/watchdog callbacks for individual orders.
#[allow(clippy::too_many_arguments)]
pub async fn submit<KV, O, S>(
    job_b64: &str,
    cfg: &orch_config::OrchConfig,
    kv: &KV,
    object_store: &O,
    secret_store: &S,
    workdir_root: &std::path::Path,
) -> Result<SubmitOutcome, SubmitError>
where
    KV: orch_store::KeyValueStore,
    O: ObjectStore,
    S: SecretStore,
{
    let job = Job::from_b64(job_b64)?;
    validate_job(&job).map_err(SubmitError::Validation)?;

    let trace_id = orch_core::ids::generate_trace_id();
    let run_id = orch_core::ids::generate_run_id();
    let flow_id = orch_core::ids::generate_flow_id(&job.username, &trace_id, &job.flow_label);
    let done_endpoint = format!("{}/{run_id}/done", cfg.done_bucket);
    let search_tag = job.pr_comment_search_tag.clone().unwrap_or_else(orch_core::ids::generate_search_tag);

    let repackaged = orch_repackager::repackage(
        &job,
        &run_id,
        &trace_id,
        &flow_id,
        object_store,
        secret_store,
        job.presign_expiry,
        "orch",
        &workdir_root.join(&run_id),
    )
    .await?;

    let now = Utc::now();
    for (index, (order, packaged)) in job.orders.iter().zip(repackaged.iter()).enumerate() {
        let archive_bytes = tokio::fs::read(&packaged.archive_path).await?;
        let archive_location = format!("tmp/exec/{run_id}/{}/exec.zip", packaged.order_num);
        orch_store::with_retry(&cfg.retry, || object_store.put_object(&archive_location, archive_bytes.clone())).await?;

        let record = OrderRecord::new_queued(
            &run_id,
            &packaged.order_num,
            &trace_id,
            &flow_id,
            index,
            order,
            order.s3_location.clone(),
            Some(packaged.callback_url.clone()),
            git_descriptor(&job, order),
            Some(archive_location),
            packaged.envelope_key_ref.clone(),
            now,
        );
        kv.put_order(record).await?;
    }

    kv.put_event(OrderEvent::job_started(&trace_id, &run_id, &flow_id, job.orders.len(), now)).await?;

    let init_trigger_path = format!("tmp/callbacks/runs/{run_id}/0000/result.json");
    let init_body = serde_json::json!({ "status": "init", "log": "" }).to_string().into_bytes();
    object_store.put_object(&init_trigger_path, init_body).await?;

    Ok(SubmitOutcome { run_id, trace_id, flow_id, done_endpoint, search_tag })
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_store::{FileObjectStore, InMemoryKeyValueStore, InMemorySecretStore};

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

    #[test]
    fn validate_job_rejects_empty_orders() {
        let job = sample_job(vec![]);
        let failure = validate_job(&job).unwrap_err();
        assert_eq!(failure.code, orch_error::ErrorCode::ValidationEmptyOrders);
    }

    #[test]
    fn validate_job_rejects_missing_code_source() {
        let job = sample_job(vec![order_json(serde_json::json!({}))]);
        let failure = validate_job(&job).unwrap_err();
        assert_eq!(failure.code, orch_error::ErrorCode::ValidationMissingCodeSource);
    }

    #[test]
    fn validate_job_rejects_agent_target_without_ssm_targets() {
        let job = sample_job(vec![order_json(serde_json::json!({
            "s3_location": "uploads/a.tar",
            "execution_target": "agent",
        }))]);
        let failure = validate_job(&job).unwrap_err();
        assert_eq!(failure.code, orch_error::ErrorCode::ValidationMissingSsmTargets);
    }

    #[test]
    fn validate_job_accepts_well_formed_job() {
        let job = sample_job(vec![order_json(serde_json::json!({ "s3_location": "uploads/a.tar" }))]);
        assert!(validate_job(&job).is_ok());
    }

    #[tokio::test]
    async fn submit_queues_one_record_per_order_and_writes_init_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = FileObjectStore::new(dir.path().join("objects")).unwrap();
        object_store.put_object("uploads/a.tar", b"payload".to_vec()).await.unwrap();
        let secret_store = InMemorySecretStore::new();
        let kv = InMemoryKeyValueStore::new();

        let mut cfg = orch_config::OrchConfig::default();
        cfg.internal_bucket = "internal".into();
        cfg.done_bucket = "done".into();

        let job = sample_job(vec![order_json(serde_json::json!({ "s3_location": "uploads/a.tar" }))]);
        let job_b64 = job.to_b64().unwrap();

        let outcome = submit(&job_b64, &cfg, &kv, &object_store, &secret_store, &dir.path().join("work")).await.unwrap();

        let records = kv.get_all_orders(&outcome.run_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, orch_core::OrderStatus::Queued);
        assert!(records[0].archive_location.is_some());

        let archive_path = records[0].archive_location.clone().unwrap();
        assert!(object_store.head_object(&archive_path).await.unwrap());

        let trigger_path = format!("tmp/callbacks/runs/{}/0000/result.json", outcome.run_id);
        assert!(object_store.head_object(&trigger_path).await.unwrap());

        let events = kv.get_events(&outcome.trace_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, orch_core::EventType::JobStarted);
    }

    #[tokio::test]
    async fn submit_rejects_invalid_job_without_touching_stores() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = FileObjectStore::new(dir.path().join("objects")).unwrap();
        let secret_store = InMemorySecretStore::new();
        let kv = InMemoryKeyValueStore::new();
        let cfg = orch_config::OrchConfig::default();

        let job = sample_job(vec![]);
        let job_b64 = job.to_b64().unwrap();

        let err = submit(&job_b64, &cfg, &kv, &object_store, &secret_store, &dir.path().join("work")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
    }
}
