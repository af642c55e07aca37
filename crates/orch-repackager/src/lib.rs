// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! orch-repackager
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use orch_core::{ExecutionTarget, Job, Order};
use orch_store::{ObjectStore, SecretStore};
use tracing::{info, warn};

const ENVELOPE_KEY_TTL_SECS: u64 = 7_200;

/// Errors assembling a per-order execution archive.
#[derive(Debug, thiserror::Error)]
pub enum RepackagerError {
    /// A parameter/secret-store credential fetch failed.
    #[error("credential fetch failed: {0}")]
    Store(#[from] orch_store::StoreError),
    /// Envelope encryption of the assembled env set failed.
    #[error("envelope encryption failed: {0}")]
    Crypto(#[from] orch_crypto::CryptoError),
    /// A git clone/checkout/copy operation failed.
    #[error("git operation failed: {0}")]
    Git(#[from] orch_git::GitError),
    /// A filesystem operation failed.
    #[error("repackager io error: {0}")]
    Io(#[from] std::io::Error),
    /// Archive (zip) production failed.
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    /// An order referenced a group whose clone did not succeed.
    #[error("no prepared source directory for order {0}")]
    MissingSourceDir(String),
}

impl From<RepackagerError> for orch_error::OrchError {
    fn from(err: RepackagerError) -> Self {
        let code = match &err {
            RepackagerError::Store(e) if e.is_transient() => orch_error::ErrorCode::StoreThrottled,
            RepackagerError::Store(_) => orch_error::ErrorCode::StoreNotFound,
            RepackagerError::Crypto(_) => orch_error::ErrorCode::CryptoEncryptFailed,
            RepackagerError::Git(_) => orch_error::ErrorCode::GitCloneFailed,
            RepackagerError::Io(_) | RepackagerError::Zip(_) | RepackagerError::MissingSourceDir(_) => {
                orch_error::ErrorCode::Internal
            }
        };
        orch_error::OrchError::new(code, err.to_string()).with_source(err)
    }
}

/// Descriptor for one order's prepared execution archive.
#[derive(Debug, Clone)]
pub struct RepackagedOrder {
    /// The order's zero-padded position (`OrderRecord::order_num`).
    pub order_num: String,
    /// The order's human-readable name.
    pub order_name: String,
    /// Local filesystem path to the produced zip archive, ready for upload.
    pub archive_path: PathBuf,
    /// Presigned PUT URL the worker/watchdog will write its callback to.
    pub callback_url: String,
    /// The isolated per-order source directory the archive was built from.
    pub code_dir: PathBuf,
    /// Secret-store path holding the auto-generated envelope private key,
    /// if one was generated (absent when the order supplied its own
    /// recipient key via `sops_key`).
    pub envelope_key_ref: Option<String>,
}

fn env_var_name_from_reference(reference: &str) -> String {
    reference
        .rsplit('/')
        .next()
        .unwrap_or(reference)
        .to_uppercase()
        .replace('-', "_")
}

fn callback_object_path(run_id: &str, order_num: &str) -> String {
    format!("tmp/callbacks/runs/{run_id}/{order_num}/result.json")
}

/// Fetch every `ssm_paths`/`secret_manager_paths` reference for `order`,
/// returning `(ssm_values, secret_values)` keyed by derived env-var name.
async fn fetch_credentials<S: SecretStore>(
    secret_store: &S,
    order: &Order,
) -> Result<(BTreeMap<String, String>, BTreeMap<String, String>), RepackagerError> {
    let mut ssm_values = BTreeMap::new();
    for reference in &order.ssm_paths {
        let value = orch_store::with_retry(&Default::default(), || secret_store.get_value(reference)).await?;
        ssm_values.insert(env_var_name_from_reference(reference), value);
    }
    let mut secret_values = BTreeMap::new();
    for reference in &order.secret_manager_paths {
        let value = orch_store::with_retry(&Default::default(), || secret_store.get_value(reference)).await?;
        secret_values.insert(env_var_name_from_reference(reference), value);
    }
    Ok((ssm_values, secret_values))
}

/// Assemble the per-order env set under the merge law: `env_vars` →
/// `ssm_values` → `secret_values` → `CALLBACK_URL` (if present) →
/// introspection fields, later wins. Introspection fields are always
/// written, defaulting to empty strings.
fn assemble_env(
    order: &Order,
    ssm_values: &BTreeMap<String, String>,
    secret_values: &BTreeMap<String, String>,
    callback_url: Option<&str>,
    trace_id: &str,
    run_id: &str,
    order_id: &str,
    order_num: &str,
    flow_id: &str,
) -> BTreeMap<String, String> {
    let mut env = order.env_vars.clone();
    env.extend(ssm_values.clone());
    env.extend(secret_values.clone());
    if let Some(url) = callback_url {
        env.insert("CALLBACK_URL".to_string(), url.to_string());
    }
    env.insert("TRACE_ID".to_string(), trace_id.to_string());
    env.insert("RUN_ID".to_string(), run_id.to_string());
    env.insert("ORDER_ID".to_string(), order_id.to_string());
    env.insert("ORDER_NUM".to_string(), order_num.to_string());
    env.insert("FLOW_ID".to_string(), flow_id.to_string());
    env
}

fn write_manifests(
    code_dir: &Path,
    env: &BTreeMap<String, String>,
    credential_keys: &BTreeSet<String>,
    envelope: &orch_crypto::EnvelopeCiphertext,
) -> Result<(), RepackagerError> {
    std::fs::write(code_dir.join("secrets.enc.json"), serde_json::to_vec_pretty(envelope)?)?;

    let names_only: String = env.keys().cloned().collect::<Vec<_>>().join("\n");
    std::fs::write(code_dir.join("env_vars.env"), names_only)?;

    let sources: String = credential_keys.iter().cloned().collect::<Vec<_>>().join("\n");
    std::fs::write(code_dir.join("secrets.src"), sources)?;
    Ok(())
}

fn write_agent_manifests(
    code_dir: &Path,
    order: &Order,
    env: &BTreeMap<String, String>,
) -> Result<(), RepackagerError> {
    std::fs::write(code_dir.join("cmds.json"), serde_json::to_vec_pretty(&order.cmds)?)?;
    std::fs::write(code_dir.join("env_vars.json"), serde_json::to_vec_pretty(env)?)?;
    Ok(())
}

fn archive_directory(code_dir: &Path, archive_path: &Path) -> Result<(), RepackagerError> {
    let file = std::fs::File::create(archive_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(code_dir).into_iter().filter_map(Result::ok) {
        let relative = entry.path().strip_prefix(code_dir).unwrap_or(entry.path());
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = relative.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            writer.add_directory(format!("{name}/"), options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(name, options)?;
            let bytes = std::fs::read(entry.path())?;
            writer.write_all(&bytes)?;
        }
    }
    writer.finish()?;
    Ok(())
}

/// Which distinct `(repo, commit)` pair a git-sourced order belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CloneGroupKey {
    repo: String,
    commit: Option<String>,
}

/// Groups `job`'s orders by `(repo, commit)`, clones each group exactly
/// once, and produces one [`RepackagedOrder`] per order in input order.
#[allow(clippy::too_many_arguments)]
pub async fn repackage<O: ObjectStore, S: SecretStore>(
    job: &Job,
    run_id: &str,
    trace_id: &str,
    flow_id: &str,
    object_store: &O,
    secret_store: &S,
    presign_expiry_secs: u64,
    secret_path_prefix: &str,
    workdir_root: &Path,
) -> Result<Vec<RepackagedOrder>, RepackagerError> {
    std::fs::create_dir_all(workdir_root)?;

    let token = match job.git_token_location.as_deref() {
        Some(reference) => Some(secret_store.get_value(reference).await?),
        None => None,
    };
    let ssh_key_path = match job.git_ssh_key_location.as_deref() {
        Some(reference) => {
            let key_contents = secret_store.get_value(reference).await?;
            let dir = workdir_root.join("ssh");
            Some(orch_git::write_ssh_key_file(&dir, &key_contents)?)
        }
        None => None,
    };

    // Clone each distinct (repo, commit) group exactly once.
    let mut group_dirs: BTreeMap<CloneGroupKey, PathBuf> = BTreeMap::new();
    for (index, order) in job.orders.iter().enumerate() {
        if order.is_s3_sourced() {
            continue;
        }
        let Some(repo) = order.resolved_git_repo(job) else {
            continue;
        };
        let key = CloneGroupKey {
            repo: repo.to_string(),
            commit: order.resolved_commit_hash(job).map(str::to_string),
        };
        if group_dirs.contains_key(&key) {
            continue;
        }
        let clone_dir = workdir_root.join("clones").join(format!("group-{index}"));
        info!(target: "orch.repackager", repo = %key.repo, commit = ?key.commit, "cloning shared source group");
        let spec = orch_git::CloneSpec {
            repo: key.repo.clone(),
            commit: key.commit.clone(),
            token: token.clone(),
            ssh_key_path: ssh_key_path.clone(),
        };
        orch_git::clone_repo(&spec, &clone_dir)?;
        group_dirs.insert(key, clone_dir);
    }

    let mut results = Vec::with_capacity(job.orders.len());
    for (index, order) in job.orders.iter().enumerate() {
        let order_num = order.effective_queue_id(index);
        let order_name = order.order_name.clone().unwrap_or_else(|| format!("order-{order_num}"));
        let code_dir = workdir_root.join("orders").join(&order_num);
        std::fs::create_dir_all(&code_dir)?;

        if order.is_s3_sourced() {
            let location = order.s3_location.as_deref().unwrap_or_default();
            if let Some(bytes) = object_store.get_object(location).await? {
                let filename = location.rsplit('/').next().unwrap_or("source.bin");
                std::fs::write(code_dir.join(filename), bytes)?;
            } else {
                warn!(target: "orch.repackager", %location, "s3-sourced order references a missing object");
            }
        } else if let Some(repo) = order.resolved_git_repo(job) {
            let key = CloneGroupKey {
                repo: repo.to_string(),
                commit: order.resolved_commit_hash(job).map(str::to_string),
            };
            let clone_dir = group_dirs
                .get(&key)
                .ok_or_else(|| RepackagerError::MissingSourceDir(order_num.clone()))?;
            orch_git::copy_tree_excluding_git(clone_dir, order.git_folder.as_deref(), &code_dir)?;
        }

        let (ssm_values, secret_values) = fetch_credentials(secret_store, order).await?;
        let credential_keys: BTreeSet<String> = order
            .ssm_paths
            .iter()
            .chain(order.secret_manager_paths.iter())
            .cloned()
            .collect();

        let callback_path = callback_object_path(run_id, &order_num);
        let callback_url = object_store.presign_put(&callback_path, presign_expiry_secs).await?;

        let env = assemble_env(
            order,
            &ssm_values,
            &secret_values,
            Some(&callback_url),
            trace_id,
            run_id,
            &order_num,
            &order_num,
            flow_id,
        );

        let (recipient_public, envelope_key_ref) = match order.sops_key.as_deref() {
            Some(supplied) => (supplied.to_string(), None),
            None => {
                let keypair = orch_crypto::generate_keypair();
                let secret_path = format!("{secret_path_prefix}/sops-keys/{run_id}/{order_num}");
                secret_store
                    .put_value(&secret_path, &keypair.private, Some(Duration::from_secs(ENVELOPE_KEY_TTL_SECS)))
                    .await?;
                (keypair.public, Some(secret_path))
            }
        };
        let envelope = orch_crypto::encrypt_env(&env, &recipient_public)?;
        write_manifests(&code_dir, &env, &credential_keys, &envelope)?;

        if order.execution_target == ExecutionTarget::Agent {
            write_agent_manifests(&code_dir, order, &env)?;
        }

        let archive_path = workdir_root.join("archives").join(format!("{order_num}.zip"));
        std::fs::create_dir_all(archive_path.parent().expect("archive path has a parent"))?;
        archive_directory(&code_dir, &archive_path)?;

        results.push(RepackagedOrder {
            order_num,
            order_name,
            archive_path,
            callback_url,
            code_dir,
            envelope_key_ref,
        });
    }

    for (_, clone_dir) in group_dirs {
        let _ = std::fs::remove_dir_all(&clone_dir);
    }

    Ok(results)
}
