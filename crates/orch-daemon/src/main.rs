#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use orch_config::load_config;
use orch_daemon::{build_app, AppState};
use orch_telemetry::{init_tracing, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "orch-daemon", version, about = "Job-orchestrator control-plane daemon")]
struct Args {
    /// Address to bind the HTTP listener to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Path to a TOML configuration file. Falls back to defaults plus
    /// environment overrides when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory for the reference object store and scratch workdirs.
    #[arg(long, default_value = "./data")]
    data_root: PathBuf,

    /// Emit newline-delimited JSON logs instead of compact text.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = load_config(args.config.as_deref())?;
    let format = if args.json_logs { LogFormat::Json } else { LogFormat::Text };
    let _ = init_tracing(&cfg.log_level, format);

    for warning in orch_config::validate_config(&cfg)? {
        tracing::warn!(%warning, "config warning");
    }

    std::fs::create_dir_all(&args.data_root)?;
    let state = Arc::new(AppState::new(cfg, &args.data_root)?);
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!(bind = %args.bind, "orch-daemon listening");
    axum::serve(listener, app).await?;
    Ok(())
}
