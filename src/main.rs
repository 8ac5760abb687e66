#![forbid(unsafe_code)]

//! `fogd` — the local agent runner daemon.
//!
//! Bootstraps configuration, opens the core `SQLite` store, serves the local
//! HTTP API (C5's session engine over axum), and — if `cloud_base_url` is
//! configured — pairs with the cloud relay and runs the C8 long-poll worker
//! alongside it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use fog::config::GlobalConfig;
use fog::engine::Engine;
use fog::http::{self, HttpState};
use fog::relay;
use fog::store::Store;
use fog::{crypto, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "fogd", about = "Local agent runner daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Defaults to `config.toml` in the current working directory, which is
    /// the expected layout for a portable installation (binary + config.toml
    /// in the same folder).
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the bind address for the local HTTP API.
    #[arg(long)]
    bind: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("fogd bootstrap");

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
    let mut config = GlobalConfig::from_toml_str(&config_text)?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    let config = Arc::new(config);
    info!(fog_home = %config.fog_home().display(), "configuration loaded");

    std::fs::create_dir_all(config.fog_home())?;
    std::fs::create_dir_all(config.repos_root())?;

    let master_key = crypto::load_or_generate_master_key(&config.master_key_path())?;

    let store = Store::open(&config.db_path()).await?;
    info!(path = %config.db_path().display(), "core database opened");

    let api_token = load_or_generate_api_token(&config.api_token_path())?;

    let engine = Arc::new(Engine::new(
        store,
        config.default_tool.clone(),
        config.branch_prefix.clone(),
    ));

    let shutdown = CancellationToken::new();

    let relay_handle = match config.cloud_base_url.clone() {
        Some(cloud_base_url) => {
            let creds = relay::load_or_create_credentials(engine.store(), &master_key).await?;
            info!(device_id = %creds.device_id, %cloud_base_url, "relay worker starting");
            let relay_engine = (*engine).clone();
            let relay_cancel = shutdown.clone();
            Some(tokio::spawn(async move {
                relay::run(relay_engine, cloud_base_url, creds, relay_cancel).await;
            }))
        }
        None => {
            info!("cloud_base_url not configured; running local-only");
            None
        }
    };

    let http_state = HttpState { engine: Arc::clone(&engine), config: Arc::clone(&config), api_token: Arc::new(api_token) };
    let app = http::router(http_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {}: {err}", config.bind_addr)))?;
    info!(addr = %config.bind_addr, "local HTTP API listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            serve_shutdown.cancel();
        })
        .await
        .map_err(|err| AppError::Io(format!("http server failed: {err}")))?;

    if let Some(handle) = relay_handle {
        let _ = handle.await;
    }

    info!("fogd shut down");
    Ok(())
}

fn load_or_generate_api_token(path: &std::path::Path) -> Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?;
        return Ok(token.trim().to_string());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let token = {
        use rand::RngCore;
        let mut buf = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut buf);
        hex::encode(buf)
    };
    std::fs::write(path, &token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(token)
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
