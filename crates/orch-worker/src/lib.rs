// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! orch-worker
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The worker contract: download an order's prepared execution archive,
//! decrypt its envelope, run its commands, and report the outcome to the
//! presigned callback URL. Real execution back-ends are out of scope, but
//! this reference worker is concrete enough to ship as the process those
//! back-ends ultimately invoke.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use orch_store::ObjectStore;

/// Maximum number of callback PUT attempts: one initial attempt plus at
/// least three retries.
pub const MAX_CALLBACK_ATTEMPTS: u32 = 4;
/// Fixed delay between callback retry attempts.
pub const CALLBACK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Errors the worker can report. A worker failure is still expected to
/// attempt a best-effort callback naming `Failed` before propagating.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The object store holding the execution archive returned an error.
    #[error("object store error: {0}")]
    Store(#[from] orch_store::StoreError),
    /// No archive was found at the expected location.
    #[error("no execution archive found at {0}")]
    ArchiveNotFound(String),
    /// The archive did not unzip cleanly.
    #[error("failed to extract execution archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    /// A filesystem operation failed.
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
    /// `secrets.enc.json` was present but malformed, or decryption failed.
    #[error("envelope decryption failed: {0}")]
    Crypto(#[from] orch_crypto::CryptoError),
}

impl From<WorkerError> for orch_error::OrchError {
    fn from(err: WorkerError) -> Self {
        let code = match &err {
            WorkerError::Store(e) if e.is_transient() => orch_error::ErrorCode::StoreThrottled,
            WorkerError::Store(_) | WorkerError::ArchiveNotFound(_) => orch_error::ErrorCode::StoreNotFound,
            WorkerError::Crypto(_) => orch_error::ErrorCode::CryptoDecryptFailed,
            WorkerError::Zip(_) | WorkerError::Io(_) => orch_error::ErrorCode::Internal,
        };
        orch_error::OrchError::new(code, err.to_string()).with_source(err)
    }
}

/// The outcome of one worker invocation against a single order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    /// Terminal status: `"succeeded"`, `"failed"`, or `"timed_out"`.
    pub status: String,
    /// Combined stdout/stderr log across every command run.
    pub log: String,
    /// `true` iff the callback PUT was acknowledged (or there was no
    /// `CALLBACK_URL` to report to, in which case there was nothing to send).
    pub callback_sent: bool,
}

/// Object-store location of an order's prepared execution archive.
pub fn archive_location(run_id: &str, order_num: &str) -> String {
    format!("tmp/exec/{run_id}/{order_num}/exec.zip")
}

/// Download and extract the execution archive for `(run_id, order_num)`
/// into a fresh subdirectory of `scratch_root`, returning that directory.
pub async fn download_and_extract<O: ObjectStore>(
    object_store: &O,
    run_id: &str,
    order_num: &str,
    scratch_root: &Path,
) -> Result<PathBuf, WorkerError> {
    let location = archive_location(run_id, order_num);
    let bytes = object_store
        .get_object(&location)
        .await?
        .ok_or_else(|| WorkerError::ArchiveNotFound(location.clone()))?;

    let work_dir = scratch_root.join(format!("{run_id}-{order_num}"));
    std::fs::create_dir_all(&work_dir)?;

    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)?;
    archive.extract(&work_dir)?;

    Ok(work_dir)
}

/// Decrypt `secrets.enc.json` in `work_dir` with `recipient_private_b64`,
/// if the file is present. A missing file or a missing key both yield an
/// empty map rather than an error, so a command-only order with no
/// secrets still runs.
pub fn decrypt_env_file(
    work_dir: &Path,
    recipient_private_b64: Option<&str>,
) -> Result<BTreeMap<String, String>, WorkerError> {
    let encrypted_path = work_dir.join("secrets.enc.json");
    if !encrypted_path.exists() {
        return Ok(BTreeMap::new());
    }
    let Some(key) = recipient_private_b64 else {
        tracing::warn!(target: "orch.worker", "secrets.enc.json present but no envelope key supplied, skipping decryption");
        return Ok(BTreeMap::new());
    };
    let raw = std::fs::read(&encrypted_path)?;
    let envelope: orch_crypto::EnvelopeCiphertext = serde_json::from_slice(&raw).map_err(orch_crypto::CryptoError::from)?;
    Ok(orch_crypto::decrypt_env(&envelope, key)?)
}

/// Resolve the list of commands to execute: a `CMDS` entry in the
/// decrypted env (a JSON array, falling back to a single-element vec if it
/// doesn't parse as one) takes precedence, then a `cmds.json` file in
/// `work_dir`, else no commands at all.
pub fn resolve_commands(env: &BTreeMap<String, String>, work_dir: &Path) -> Vec<String> {
    if let Some(raw) = env.get("CMDS") {
        return match serde_json::from_str::<Vec<String>>(raw) {
            Ok(cmds) => cmds,
            Err(_) => vec![raw.clone()],
        };
    }
    let cmds_path = work_dir.join("cmds.json");
    if let Ok(raw) = std::fs::read(&cmds_path) {
        if let Ok(cmds) = serde_json::from_slice::<Vec<String>>(&raw) {
            return cmds;
        }
    }
    Vec::new()
}

/// Run `cmds` sequentially in `work_dir` under `env`, stopping at the
/// first non-zero exit. Each command runs via `sh -c`, with stderr
/// redirected into stdout so the combined log reads in execution order.
/// `timeout` of zero means no deadline.
pub async fn execute_commands(
    cmds: &[String],
    work_dir: &Path,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> (String, String) {
    let mut combined_log = Vec::new();
    let mut status = "succeeded".to_string();

    for cmd in cmds {
        tracing::info!(target: "orch.worker", %cmd, "executing command");
        combined_log.push(format!("$ {cmd}"));

        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(format!("{cmd} 2>&1")).current_dir(work_dir).envs(env.iter());
        command.stdout(std::process::Stdio::piped());

        let spawn_result = command.spawn();
        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                combined_log.push(format!("Error: {e}"));
                status = "failed".to_string();
                break;
            }
        };

        let wait = async {
            let stdout = child.stdout.take();
            let output = child.wait_with_output().await;
            (output, stdout.is_some())
        };

        let outcome = if timeout.is_zero() {
            Some(wait.await.0)
        } else {
            match tokio::time::timeout(timeout, wait).await {
                Ok((output, _)) => Some(output),
                Err(_) => {
                    combined_log.push(format!("Command timed out after {}s", timeout.as_secs()));
                    status = "timed_out".to_string();
                    None
                }
            }
        };

        let Some(output) = outcome else {
            break;
        };

        match output {
            Ok(output) => {
                let text = String::from_utf8_lossy(&output.stdout);
                combined_log.push(text.into_owned());
                if !output.status.success() {
                    let code = output.status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
                    combined_log.push(format!("Exit code: {code}"));
                    status = "failed".to_string();
                    break;
                }
            }
            Err(e) => {
                combined_log.push(format!("Error: {e}"));
                status = "failed".to_string();
                break;
            }
        }
    }

    (status, combined_log.join("\n"))
}

/// PUT `{"status": status, "log": log}` to `callback_url`, retrying up to
/// [`MAX_CALLBACK_ATTEMPTS`] times with a fixed [`CALLBACK_RETRY_DELAY`]
/// between attempts. Returns `true` iff an attempt received a 2xx
/// response.
pub async fn send_callback(client: &reqwest::Client, callback_url: &str, status: &str, log: &str) -> bool {
    let payload = serde_json::json!({ "status": status, "log": log });
    for attempt in 1..=MAX_CALLBACK_ATTEMPTS {
        match client
            .put(callback_url)
            .header("content-type", "application/json")
            .json(&payload)
            .timeout(Duration::from_secs(30))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(target: "orch.worker", %status, "callback sent");
                return true;
            }
            Ok(resp) => {
                tracing::warn!(target: "orch.worker", status_code = %resp.status(), attempt, max_attempts = MAX_CALLBACK_ATTEMPTS, "callback rejected");
            }
            Err(e) => {
                tracing::warn!(target: "orch.worker", error = %e, attempt, max_attempts = MAX_CALLBACK_ATTEMPTS, "callback attempt failed");
            }
        }
        if attempt < MAX_CALLBACK_ATTEMPTS {
            tokio::time::sleep(CALLBACK_RETRY_DELAY).await;
        }
    }
    tracing::error!(target: "orch.worker", %status, "all callback retries exhausted");
    false
}

/// Run the full worker contract for one order: download, decrypt, execute,
/// callback. `envelope_key` is the caller-supplied recipient private key
/// (CLI flag or `ENVELOPE_PRIVATE_KEY` fallback); `None` means the order's
/// archive is expected to carry no `secrets.enc.json`, or decryption is
/// skipped and the order runs with an empty environment.
pub async fn run_order<O: ObjectStore>(
    object_store: &O,
    client: &reqwest::Client,
    run_id: &str,
    order_num: &str,
    envelope_key: Option<&str>,
    scratch_root: &Path,
) -> Result<WorkerOutcome, WorkerError> {
    let work_dir = download_and_extract(object_store, run_id, order_num, scratch_root).await?;
    let env = decrypt_env_file(&work_dir, envelope_key)?;
    let callback_url = env.get("CALLBACK_URL").cloned();
    let cmds = resolve_commands(&env, &work_dir);

    if cmds.is_empty() {
        tracing::error!(target: "orch.worker", %run_id, %order_num, "no commands found to execute");
        let callback_sent = match callback_url {
            Some(url) => send_callback(client, &url, "failed", "No commands found to execute").await,
            None => false,
        };
        return Ok(WorkerOutcome { status: "failed".to_string(), log: "No commands found to execute".to_string(), callback_sent });
    }

    let timeout_secs: u64 = env.get("TIMEOUT").and_then(|v| v.parse().ok()).unwrap_or(0);
    let (status, log) = execute_commands(&cmds, &work_dir, &env, Duration::from_secs(timeout_secs)).await;

    let callback_sent = match callback_url {
        Some(url) => send_callback(client, &url, &status, &log).await,
        None => {
            tracing::warn!(target: "orch.worker", "no CALLBACK_URL present in decrypted env, skipping callback");
            false
        }
    };

    Ok(WorkerOutcome { status, log, callback_sent })
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_store::FileObjectStore;
    use std::io::Write as _;

    async fn seed_archive(object_store: &FileObjectStore, run_id: &str, order_num: &str, files: &[(&str, &[u8])]) {
        let buf = Vec::new();
        let cursor = std::io::Cursor::new(buf);
        let mut writer = zip::ZipWriter::new(cursor);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        let cursor = writer.finish().unwrap();
        let bytes = cursor.into_inner();
        let location = archive_location(run_id, order_num);
        object_store.put_object(&location, bytes).await.unwrap();
    }

    #[tokio::test]
    async fn download_and_extract_materializes_files() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = FileObjectStore::new(dir.path().join("objects")).unwrap();
        seed_archive(&object_store, "run-1", "0001", &[("cmds.json", br#"["echo hi"]"#)]);

        let work_dir = download_and_extract(&object_store, "run-1", "0001", &dir.path().join("scratch")).await.unwrap();
        assert!(work_dir.join("cmds.json").exists());
    }

    #[tokio::test]
    async fn missing_archive_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = FileObjectStore::new(dir.path().join("objects")).unwrap();
        let err = download_and_extract(&object_store, "run-x", "0001", &dir.path().join("scratch")).await.unwrap_err();
        assert!(matches!(err, WorkerError::ArchiveNotFound(_)));
    }

    #[test]
    fn decrypt_env_file_with_no_ciphertext_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let env = decrypt_env_file(dir.path(), Some("irrelevant")).unwrap();
        assert!(env.is_empty());
    }

    #[test]
    fn decrypt_env_file_without_key_skips_decryption() {
        let dir = tempfile::tempdir().unwrap();
        let kp = orch_crypto::generate_keypair();
        let mut sample = BTreeMap::new();
        sample.insert("FOO".to_string(), "bar".to_string());
        let envelope = orch_crypto::encrypt_env(&sample, &kp.public).unwrap();
        std::fs::write(dir.path().join("secrets.enc.json"), serde_json::to_vec(&envelope).unwrap()).unwrap();

        let env = decrypt_env_file(dir.path(), None).unwrap();
        assert!(env.is_empty());
    }

    #[test]
    fn decrypt_env_file_roundtrips_with_correct_key() {
        let dir = tempfile::tempdir().unwrap();
        let kp = orch_crypto::generate_keypair();
        let mut sample = BTreeMap::new();
        sample.insert("FOO".to_string(), "bar".to_string());
        let envelope = orch_crypto::encrypt_env(&sample, &kp.public).unwrap();
        std::fs::write(dir.path().join("secrets.enc.json"), serde_json::to_vec(&envelope).unwrap()).unwrap();

        let env = decrypt_env_file(dir.path(), Some(&kp.private)).unwrap();
        assert_eq!(env.get("FOO"), Some(&"bar".to_string()));
    }

    #[test]
    fn resolve_commands_prefers_cmds_env_as_json_array() {
        let mut env = BTreeMap::new();
        env.insert("CMDS".to_string(), r#"["echo a", "echo b"]"#.to_string());
        let dir = tempfile::tempdir().unwrap();
        let cmds = resolve_commands(&env, dir.path());
        assert_eq!(cmds, vec!["echo a".to_string(), "echo b".to_string()]);
    }

    #[test]
    fn resolve_commands_falls_back_to_raw_string_on_bad_json() {
        let mut env = BTreeMap::new();
        env.insert("CMDS".to_string(), "echo not-json-array".to_string());
        let dir = tempfile::tempdir().unwrap();
        let cmds = resolve_commands(&env, dir.path());
        assert_eq!(cmds, vec!["echo not-json-array".to_string()]);
    }

    #[test]
    fn resolve_commands_reads_cmds_json_file() {
        let env = BTreeMap::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cmds.json"), br#"["echo from-file"]"#).unwrap();
        let cmds = resolve_commands(&env, dir.path());
        assert_eq!(cmds, vec!["echo from-file".to_string()]);
    }

    #[test]
    fn resolve_commands_empty_when_nothing_present() {
        let env = BTreeMap::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_commands(&env, dir.path()).is_empty());
    }

    #[tokio::test]
    async fn execute_commands_succeeds_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::new();
        let (status, log) = execute_commands(&["echo hello".to_string()], dir.path(), &env, Duration::ZERO).await;
        assert_eq!(status, "succeeded");
        assert!(log.contains("hello"));
    }

    #[tokio::test]
    async fn execute_commands_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::new();
        let cmds = vec!["exit 3".to_string(), "echo should-not-run".to_string()];
        let (status, log) = execute_commands(&cmds, dir.path(), &env, Duration::ZERO).await;
        assert_eq!(status, "failed");
        assert!(log.contains("Exit code: 3"));
        assert!(!log.contains("should-not-run"));
    }

    #[tokio::test]
    async fn execute_commands_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::new();
        let cmds = vec!["sleep 5".to_string()];
        let (status, _log) = execute_commands(&cmds, dir.path(), &env, Duration::from_millis(50)).await;
        assert_eq!(status, "timed_out");
    }

    #[tokio::test]
    async fn run_order_reports_failed_when_no_commands_found() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = FileObjectStore::new(dir.path().join("objects")).unwrap();
        seed_archive(&object_store, "run-2", "0001", &[("README.txt", b"nothing to run")]);
        let client = reqwest::Client::new();

        let outcome = run_order(&object_store, &client, "run-2", "0001", None, &dir.path().join("scratch")).await.unwrap();
        assert_eq!(outcome.status, "failed");
        assert!(outcome.log.contains("No commands found"));
        assert!(!outcome.callback_sent);
    }

    #[tokio::test]
    async fn run_order_executes_plaintext_cmds_without_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let object_store = FileObjectStore::new(dir.path().join("objects")).unwrap();
        seed_archive(&object_store, "run-3", "0001", &[("cmds.json", br#"["echo worker-ran"]"#)]);
        let client = reqwest::Client::new();

        let outcome = run_order(&object_store, &client, "run-3", "0001", None, &dir.path().join("scratch")).await.unwrap();
        assert_eq!(outcome.status, "succeeded");
        assert!(outcome.log.contains("worker-ran"));
        assert!(!outcome.callback_sent);
    }
}
