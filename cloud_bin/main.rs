#![forbid(unsafe_code)]

//! `fogcloud` — the multi-tenant Slack-facing cloud relay.
//!
//! Bootstraps configuration, opens the cloud `SQLite` store, and serves the
//! Slack Events/OAuth webhook plus the device pairing and job-queue API
//! (C6, C7) that paired `fogd` instances long-poll against (C8).

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use fog::cloud::server::{self, CloudState};
use fog::cloud::CloudStore;
use fog::config::CloudConfig;
use fog::crypto;
use fog::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "fogcloud", about = "Slack-facing cloud relay", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the bind address for the cloud HTTP API.
    #[arg(long)]
    bind: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("fogcloud bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config_text = std::fs::read_to_string(&args.config).map_err(|err| {
        AppError::Config(format!(
            "cannot read config file '{}': {err} — copy config.toml next to the \
             binary, or pass --config <path>",
            args.config.display()
        ))
    })?;
    let mut config = CloudConfig::from_toml_str(&config_text)?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    info!(cloud_data_dir = %config.cloud_data_dir.display(), "configuration loaded");

    std::fs::create_dir_all(&config.cloud_data_dir)?;

    let master_key = crypto::load_or_generate_master_key(&config.master_key_path());
    let master_key = master_key?;

    let store = CloudStore::open(&config.db_path()).await?;
    info!(path = %config.db_path().display(), "cloud database opened");

    let bind_addr = config.bind_addr.clone();
    let state = CloudState::new(store, config, master_key)?;
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind_addr}: {err}")))?;
    info!(addr = %bind_addr, "cloud HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Io(format!("http server failed: {err}")))?;

    info!("fogcloud shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                error!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
