#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use orch_store::FileObjectStore;
use orch_worker::run_order;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "orch-worker", version, about = "Reference worker: download, decrypt, run, and callback")]
struct Args {
    /// Run id of the order to execute.
    #[arg(long)]
    run_id: String,

    /// Zero-padded order number of the order to execute.
    #[arg(long)]
    order_num: String,

    /// Root directory of the object store the execution archive lives in.
    #[arg(long, default_value = "./data/objects")]
    data_root: PathBuf,

    /// Scratch directory the archive is extracted into.
    #[arg(long, default_value = "./data/scratch")]
    scratch_root: PathBuf,

    /// Envelope private key, base64-encoded. Falls back to the
    /// `ENVELOPE_PRIVATE_KEY` process environment variable, mirroring the
    /// worker contract's "else sourced from its own environment".
    #[arg(long)]
    envelope_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let envelope_key = args.envelope_key.or_else(|| std::env::var("ENVELOPE_PRIVATE_KEY").ok());

    let object_store = FileObjectStore::new(&args.data_root)?;
    let client = reqwest::Client::new();

    let outcome = run_order(
        &object_store,
        &client,
        &args.run_id,
        &args.order_num,
        envelope_key.as_deref(),
        &args.scratch_root,
    )
    .await?;

    tracing::info!(
        run_id = %args.run_id,
        order_num = %args.order_num,
        status = %outcome.status,
        callback_sent = outcome.callback_sent,
        "worker finished"
    );

    if outcome.status != "succeeded" {
        std::process::exit(1);
    }
    Ok(())
}
