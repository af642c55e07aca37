#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orch_config::OrchConfig;
use orch_core::Job;
use orch_dispatch::BackendRegistry;
use orch_engine::controller::{run_controller, ControllerOutcome};
use orch_engine::initiator::{self, validate_job};
use orch_store::{FileObjectStore, InMemoryKeyValueStore, InMemorySecretStore};
use tracing_subscriber::EnvFilter;

const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "orch", version, about = "Job-orchestrator operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode and validate a job file without submitting it.
    Validate {
        /// Path to the job JSON file.
        file: PathBuf,
    },

    /// Submit a job against a fresh local store.
    Submit {
        /// Path to the job JSON file.
        file: PathBuf,

        /// Root directory for the reference object store and scratch workdirs.
        #[arg(long, default_value = "./data")]
        data_root: PathBuf,
    },

    /// Submit a job and drive the controller loop to completion against
    /// the `mock` back-end, printing the terminal artifact.
    Run {
        /// Path to the job JSON file.
        file: PathBuf,

        /// Root directory for the reference object store and scratch workdirs.
        #[arg(long, default_value = "./data")]
        data_root: PathBuf,

        /// Maximum controller passes before giving up.
        #[arg(long, default_value_t = 20)]
        max_passes: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { EnvFilter::new("orch=debug") } else { EnvFilter::new("orch=info") };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let result = match cli.command {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Submit { file, data_root } => cmd_submit(&file, &data_root).await,
        Commands::Run { file, data_root, max_passes } => cmd_run(&file, &data_root, max_passes).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

fn read_job(file: &std::path::Path) -> Result<Job> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse job from {}", file.display()))
}

fn cmd_validate(file: &std::path::Path) -> Result<()> {
    let job = read_job(file)?;
    match validate_job(&job) {
        Ok(()) => {
            println!("valid");
            Ok(())
        }
        Err(failure) => {
            println!("invalid: {failure}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}

fn local_config(_data_root: &std::path::Path) -> OrchConfig {
    let mut cfg = OrchConfig::default();
    cfg.internal_bucket = "internal".into();
    cfg.done_bucket = "done".into();
    cfg
}

async fn cmd_submit(file: &std::path::Path, data_root: &std::path::Path) -> Result<()> {
    let job = read_job(file)?;
    let job_b64 = job.to_b64()?;
    let cfg = local_config(data_root);

    std::fs::create_dir_all(data_root)?;
    let kv = InMemoryKeyValueStore::new();
    let object_store = FileObjectStore::new(data_root.join("objects"))?;
    let secret_store = InMemorySecretStore::new();

    let outcome = initiator::submit(&job_b64, &cfg, &kv, &object_store, &secret_store, &data_root.join("work"))
        .await
        .map_err(anyhow::Error::new)?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn cmd_run(file: &std::path::Path, data_root: &std::path::Path, max_passes: u32) -> Result<()> {
    let job = read_job(file)?;
    let job_b64 = job.to_b64()?;
    let cfg = local_config(data_root);

    std::fs::create_dir_all(data_root)?;
    let kv = InMemoryKeyValueStore::new();
    let object_store = FileObjectStore::new(data_root.join("objects"))?;
    let secret_store = InMemorySecretStore::new();

    let outcome = initiator::submit(&job_b64, &cfg, &kv, &object_store, &secret_store, &data_root.join("work"))
        .await
        .map_err(anyhow::Error::new)?;
    println!("submitted run {}", outcome.run_id);

    let registry = BackendRegistry::all_mock(std::sync::Arc::new(FileObjectStore::new(data_root.join("objects"))?));
    let mut trigger_key = format!("tmp/callbacks/runs/{}/0000/result.json", outcome.run_id);

    for pass in 1..=max_passes {
        let (run_outcome, _metrics) = run_controller(&trigger_key, &cfg, &kv, &object_store, &registry)
            .await
            .map_err(anyhow::Error::new)?;

        tracing::info!(pass, outcome = ?run_outcome, "controller pass");
        match run_outcome {
            ControllerOutcome::Finalized { job_status, summary } => {
                println!(
                    "finalized: {:?} (succeeded={}, failed={}, timed_out={})",
                    job_status, summary.succeeded, summary.failed, summary.timed_out
                );
                return Ok(());
            }
            ControllerOutcome::NoOrders => {
                anyhow::bail!("run {} has no order records", outcome.run_id);
            }
            ControllerOutcome::Skipped | ControllerOutcome::InProgress => {
                // Re-trigger on the same key; callbacks already written by
                // the mock back-end are picked up on the next pass.
                trigger_key = format!("tmp/callbacks/runs/{}/0000/result.json", outcome.run_id);
            }
        }
    }

    anyhow::bail!("run {} did not finalize within {max_passes} controller passes", outcome.run_id)
}
