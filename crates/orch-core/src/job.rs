//! Transient submission types: `Job` and `Order`.

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_presign_expiry() -> u64 {
    7200
}

fn default_job_timeout() -> u64 {
    3600
}

fn default_flow_label() -> String {
    "exec".to_string()
}

fn default_true() -> bool {
    true
}

/// A submission containing one or more orders plus job-level defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Caller identity; used as the leading segment of `flow_id`.
    pub username: String,
    /// Job-level git repository, used as a fallback for orders that omit one.
    #[serde(default)]
    pub git_repo: Option<String>,
    /// Secret-store reference for the git access token.
    #[serde(default)]
    pub git_token_location: Option<String>,
    /// Secret-store reference for an optional SSH deploy key.
    #[serde(default)]
    pub git_ssh_key_location: Option<String>,
    /// Job-level commit pin, used as a fallback for orders that omit one.
    #[serde(default)]
    pub commit_hash: Option<String>,
    /// The orders to execute.
    pub orders: Vec<Order>,
    /// Optional pull-request number this run is reporting back to.
    #[serde(default)]
    pub pr_number: Option<u64>,
    /// Optional issue number this run is reporting back to.
    #[serde(default)]
    pub issue_number: Option<u64>,
    /// Explicit PR-comment search tag; generated if absent.
    #[serde(default)]
    pub pr_comment_search_tag: Option<String>,
    /// Expiry, in seconds, for generated presigned callback URLs.
    #[serde(default = "default_presign_expiry")]
    pub presign_expiry: u64,
    /// Overall job timeout in seconds (informational; per-order timeouts govern dispatch).
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u64,
    /// Flow label, the trailing segment of `flow_id`.
    #[serde(default = "default_flow_label")]
    pub flow_label: String,
}

/// Errors decoding a submitted job payload.
#[derive(Debug, Error)]
pub enum JobCodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid job JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Job {
    /// Encode as `base64(JSON)`, the submission wire format.
    pub fn to_b64(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Decode from `base64(JSON)`.
    pub fn from_b64(encoded: &str) -> Result<Self, JobCodecError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        let job = serde_json::from_slice(&bytes)?;
        Ok(job)
    }
}

/// Back-end discriminator for an order's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    /// A serverless function runner.
    Function,
    /// A managed build service.
    Build,
    /// A remote-command agent addressed by instance id or tag.
    Agent,
}

impl Default for ExecutionTarget {
    fn default() -> Self {
        ExecutionTarget::Build
    }
}

/// Addressing for the `agent` back-end: either explicit instance ids or a tag filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SsmTargets {
    /// Explicit instance identifiers to target.
    #[serde(default)]
    pub instance_ids: Vec<String>,
    /// Tag-based target selection.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl SsmTargets {
    /// `true` iff this target set addresses at least one instance.
    pub fn is_empty(&self) -> bool {
        self.instance_ids.is_empty() && self.tags.is_empty()
    }
}

/// A single unit of execution within a job.
///
/// Deserializes from the wire shape via [`OrderWire`], which additionally
/// accepts the legacy `use_lambda` boolean and resolves it against
/// `execution_target`: when both are present, `execution_target` wins;
/// when only `use_lambda` is present, `true` maps to `function` and
/// `false` maps to `build`.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub cmds: Vec<String>,
    pub timeout: u64,
    pub order_name: Option<String>,
    pub s3_location: Option<String>,
    pub git_repo: Option<String>,
    pub git_folder: Option<String>,
    pub commit_hash: Option<String>,
    pub env_vars: BTreeMap<String, String>,
    pub ssm_paths: Vec<String>,
    pub secret_manager_paths: Vec<String>,
    pub execution_target: ExecutionTarget,
    pub queue_id: Option<String>,
    pub dependencies: Vec<String>,
    pub must_succeed: bool,
    pub sops_key: Option<String>,
    pub ssm_targets: Option<SsmTargets>,
}

/// Wire shape for [`Order`], carrying the legacy `use_lambda` field.
#[derive(Debug, Clone, Deserialize)]
struct OrderWire {
    cmds: Vec<String>,
    timeout: u64,
    #[serde(default)]
    order_name: Option<String>,
    #[serde(default)]
    s3_location: Option<String>,
    #[serde(default)]
    git_repo: Option<String>,
    #[serde(default)]
    git_folder: Option<String>,
    #[serde(default)]
    commit_hash: Option<String>,
    #[serde(default)]
    env_vars: BTreeMap<String, String>,
    #[serde(default)]
    ssm_paths: Vec<String>,
    #[serde(default)]
    secret_manager_paths: Vec<String>,
    #[serde(default)]
    execution_target: Option<ExecutionTarget>,
    /// Legacy boolean discriminator: `true` => function, `false` => build.
    #[serde(default)]
    use_lambda: Option<bool>,
    #[serde(default)]
    queue_id: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default = "default_true")]
    must_succeed: bool,
    #[serde(default)]
    sops_key: Option<String>,
    #[serde(default)]
    ssm_targets: Option<SsmTargets>,
}

impl From<OrderWire> for Order {
    fn from(wire: OrderWire) -> Self {
        let execution_target = wire.execution_target.unwrap_or_else(|| match wire.use_lambda {
            Some(true) => ExecutionTarget::Function,
            Some(false) => ExecutionTarget::Build,
            None => ExecutionTarget::default(),
        });
        Order {
            cmds: wire.cmds,
            timeout: wire.timeout,
            order_name: wire.order_name,
            s3_location: wire.s3_location,
            git_repo: wire.git_repo,
            git_folder: wire.git_folder,
            commit_hash: wire.commit_hash,
            env_vars: wire.env_vars,
            ssm_paths: wire.ssm_paths,
            secret_manager_paths: wire.secret_manager_paths,
            execution_target,
            queue_id: wire.queue_id,
            dependencies: wire.dependencies,
            must_succeed: wire.must_succeed,
            sops_key: wire.sops_key,
            ssm_targets: wire.ssm_targets,
        }
    }
}

impl<'de> Deserialize<'de> for Order {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = OrderWire::deserialize(deserializer)?;
        Ok(Order::from(wire))
    }
}

impl Order {
    /// The order's queue id, defaulting to its zero-padded position in the job.
    pub fn effective_queue_id(&self, index: usize) -> String {
        self.queue_id
            .clone()
            .unwrap_or_else(|| crate::ids::order_num(index))
    }

    /// Resolve the git repo this order should clone, falling back to the job's.
    pub fn resolved_git_repo<'a>(&'a self, job: &'a Job) -> Option<&'a str> {
        self.git_repo.as_deref().or(job.git_repo.as_deref())
    }

    /// Resolve the commit pin this order should check out, falling back to the job's.
    pub fn resolved_commit_hash<'a>(&'a self, job: &'a Job) -> Option<&'a str> {
        self.commit_hash.as_deref().or(job.commit_hash.as_deref())
    }

    /// `true` iff this order sources its code from the object store rather than git.
    pub fn is_s3_sourced(&self) -> bool {
        self.s3_location.is_some()
    }
}
