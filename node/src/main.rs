// Copyright (c) 2026 H2Credit Developers. MIT License.
// See LICENSE for details.

//! # H2Credit Node
//!
//! Entry point for the `h2credit-node` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the credit database and serves the
//! REST API.
//!
//! The binary supports three subcommands:
//!
//! - `run`     start the API and metrics servers
//! - `init`    create the data directory and a default `config.toml`
//! - `version` print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use h2credit_protocol::config::{EngineConfig, ENGINE_VERSION};
use h2credit_protocol::engine::CreditEngine;
use h2credit_protocol::ledger::InMemoryLedger;
use h2credit_protocol::storage::CreditDb;
use h2credit_protocol::verification::EfficiencyOracle;

use cli::{Commands, H2CreditNodeCli};
use logging::{LogFormat, DEFAULT_DIRECTIVE};
use metrics::NodeMetrics;

const CONFIG_FILE: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = H2CreditNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Resolves the engine configuration: an explicit `--config` path, then
/// `config.toml` in the data directory, then built-in defaults.
fn load_config(explicit: Option<&Path>, data_dir: &Path) -> Result<(EngineConfig, Option<PathBuf>)> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => Some(data_dir.join(CONFIG_FILE)).filter(|p| p.exists()),
    };
    match path {
        Some(path) => {
            let config = EngineConfig::load(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            Ok((config, Some(path)))
        }
        None => Ok((EngineConfig::default(), None)),
    }
}

/// Starts the API and metrics servers and blocks until shutdown.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_DIRECTIVE, args.log_format);

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting h2credit-node"
    );

    let (config, config_path) = load_config(args.config.as_deref(), &args.data_dir)?;
    match &config_path {
        Some(path) => tracing::info!(path = %path.display(), "configuration loaded"),
        None => tracing::info!("no config file found, using defaults"),
    }

    // --- Persistent storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = CreditDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    // --- Ledger and oracle ---
    let ledger = Arc::new(InMemoryLedger::new());
    tracing::warn!("using the in-memory devnet ledger; ledger state is lost on restart");
    let oracle = Arc::new(EfficiencyOracle::default());

    let engine = CreditEngine::new(db, ledger, oracle, config).context("failed to start engine")?;

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- Application state ---
    let app_state = api::AppState {
        version: format!("{} (engine {})", env!("CARGO_PKG_VERSION"), ENGINE_VERSION),
        engine: Arc::new(engine),
        sessions: Arc::new(api::SessionTable::with_ttl(Duration::from_secs(
            args.session_ttl_secs,
        ))),
        metrics: Arc::clone(&node_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    tracing::info!("h2credit-node stopped");
    Ok(())
}

/// Creates the data directory and writes the default engine configuration.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("h2credit_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    tracing::info!(data_dir = %data_dir.display(), "initializing node");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let config_path = write_default_config(data_dir, args.force)?;
    tracing::info!(path = %config_path.display(), "default configuration written");

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config file    : {}", config_path.display());

    Ok(())
}

/// Writes `config.toml` with default settings. An existing file is kept
/// unless `force` is set.
fn write_default_config(data_dir: &Path, force: bool) -> Result<PathBuf> {
    let path = data_dir.join(CONFIG_FILE);
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }
    let rendered = EngineConfig::default()
        .to_toml_string()
        .context("failed to render default config")?;
    std::fs::write(&path, rendered)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Prints version information to stdout.
fn print_version() {
    println!("h2credit-node {}", env!("CARGO_PKG_VERSION"));
    println!("engine        {}", ENGINE_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed the failure is logged and that signal is ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_a_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_default_config(dir.path(), false).unwrap();

        let (config, used) = load_config(None, dir.path()).unwrap();
        assert_eq!(used.as_deref(), Some(path.as_path()));
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "hydrogen_offset_factor = 2.0\n").unwrap();

        assert!(write_default_config(dir.path(), false).is_err());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "hydrogen_offset_factor = 2.0\n"
        );

        write_default_config(dir.path(), true).unwrap();
        assert_ne!(
            std::fs::read_to_string(&path).unwrap(),
            "hydrogen_offset_factor = 2.0\n"
        );
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, used) = load_config(None, dir.path()).unwrap();
        assert!(used.is_none());
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_config(Some(missing.as_path()), dir.path()).is_err());
    }
}
