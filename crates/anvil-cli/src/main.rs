#![warn(missing_docs)]

//! Anvil command-line driver.
//!
//! Runs one `search` or `execute` operation against the configured snapshot
//! and upstream API, printing the truncated JSON result.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anvil_config::AnvilConfig;
use anvil_sandbox::UpstreamDispatcher;
use anvil_service::ExecutionService;
use anvil_snapshot::SpecSnapshot;
use anvil_upstream::{HttpUpstream, TimeoutUpstream, DEFAULT_UPSTREAM_TIMEOUT};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run agent-written code against an API snapshot or the live API", long_about = None)]
struct Cli {
    /// Config file (defaults to $ANVIL_CONFIG, then ./anvil.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Snapshot file, overriding `[snapshot] path`
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run code against the API specification snapshot (`spec`)
    Search {
        /// Code, `@path` to read it from a file, or `-` for stdin
        code: String,
    },

    /// Run code against the live API with `request(...)`
    Execute {
        /// Code, `@path` to read it from a file, or `-` for stdin
        code: String,

        /// Account the code acts on (`accountId`)
        #[arg(long)]
        account_id: String,

        /// API token attached to each request
        #[arg(long, env = "ANVIL_API_TOKEN", hide_env_values = true, default_value = "")]
        token: String,
    },
}

/// Resolve a code argument: inline text, `@file` or `-` for stdin.
fn read_code(arg: &str) -> Result<String> {
    if arg == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("failed to read code from stdin")?;
        return Ok(code);
    }
    if let Some(path) = arg.strip_prefix('@') {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read code from {}", path));
    }
    Ok(arg.to_string())
}

/// Locate the config file.
///
/// Search order:
/// 1. `--config`
/// 2. `ANVIL_CONFIG` environment variable
/// 3. `./anvil.toml` in the current directory
/// 4. None (no config file found — not an error)
fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("ANVIL_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("anvil.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config(explicit: Option<&Path>) -> Result<AnvilConfig> {
    match find_config_file(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            AnvilConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(AnvilConfig::from_toml("")?)
        }
    }
}

fn load_snapshot(config: &AnvilConfig, explicit: Option<&Path>) -> Result<SpecSnapshot> {
    match explicit.or(config.snapshot.path.as_deref()) {
        Some(path) => SpecSnapshot::from_file(path)
            .with_context(|| format!("failed to load snapshot from {}", path.display())),
        None => {
            tracing::warn!("no snapshot configured, search runs against an empty `spec`");
            Ok(SpecSnapshot::new())
        }
    }
}

fn build_upstream(config: &AnvilConfig) -> Result<Arc<dyn UpstreamDispatcher>> {
    let timeout = config
        .upstream
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT);
    let http: Arc<dyn UpstreamDispatcher> = Arc::new(HttpUpstream::new(timeout)?);
    Ok(Arc::new(TimeoutUpstream::new(http, timeout)))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let snapshot = load_snapshot(&config, cli.snapshot.as_deref())?;
    let upstream = build_upstream(&config)?;
    let service = ExecutionService::from_config(&config, snapshot, Some(upstream))
        .context("failed to start execution service")?;

    let result = match &cli.command {
        Commands::Search { code } => service.search(&read_code(code)?).await,
        Commands::Execute {
            code,
            account_id,
            token,
        } => {
            if token.is_empty() {
                tracing::warn!("ANVIL_API_TOKEN is not set, requests are sent without credentials");
            }
            service.execute(&read_code(code)?, account_id, token).await
        }
    };

    tracing::debug!(stats = ?service.stats(), "cache counters");

    match result {
        Ok(json) => {
            println!("{json}");
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            eprintln!("{error}");
            Ok(ExitCode::FAILURE)
        }
    }
}
