//! # CLI Interface
//!
//! Command-line arguments for `h2credit-node`, built with `clap` derive.
//! Every flag of `run` can also come from an `H2CREDIT_*` environment
//! variable.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use h2credit_protocol::config::{DEFAULT_API_PORT, DEFAULT_METRICS_PORT};

use crate::api::DEFAULT_SESSION_TTL;
use crate::logging::LogFormat;

/// H2Credit marketplace node.
///
/// Serves the REST API for NGOs, auditors and buyers on top of the credit
/// lifecycle engine, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "h2credit-node",
    about = "H2Credit hydrogen-credit marketplace node",
    version,
    propagate_version = true
)]
pub struct H2CreditNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the API and metrics servers.
    Run(RunArgs),
    /// Create the data directory and write a default `config.toml`.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Engine configuration file (TOML).
    ///
    /// When omitted, `config.toml` in the data directory is used if present,
    /// built-in defaults otherwise.
    #[arg(long, short = 'c', env = "H2CREDIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the credit database.
    #[arg(long, short = 'd', env = "H2CREDIT_DATA_DIR", default_value = "./h2credit-data")]
    pub data_dir: PathBuf,

    /// Port for the REST API.
    #[arg(long, env = "H2CREDIT_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "H2CREDIT_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log output format.
    #[arg(long, env = "H2CREDIT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Seconds a session token stays valid after login.
    #[arg(long, env = "H2CREDIT_SESSION_TTL_SECS", default_value_t = DEFAULT_SESSION_TTL.as_secs())]
    pub session_ttl_secs: u64,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "H2CREDIT_DATA_DIR", default_value = "./h2credit-data")]
    pub data_dir: PathBuf,

    /// Overwrite an existing `config.toml`.
    #[arg(long)]
    pub force: bool,
}
