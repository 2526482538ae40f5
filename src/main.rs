mod backend;
mod backoff;
mod canonical;
mod config;
mod error;
mod governance;
mod lifecycle;
mod model;
mod sandbox;
mod signing;
mod worker;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backend::RestBackend;
use crate::config::Config;
use crate::worker::Worker;

const DEFAULT_CONFIG_PATH: &str = "config/worker.toml";

fn print_help() {
    println!(
        "\
warden-agent v{}

A zero-trust worker that polls a shared command queue and executes
signed commands inside a local sandbox directory.

USAGE:
    warden-agent [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]

OPTIONS:
    -h, --help        Print this help message and exit
    -V, --version     Print version and exit
        --check-config
                      Load and validate the configuration, print a summary, exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                 Log level filter for tracing
                             (e.g. debug, warden_agent=debug,security=info)
    WARDEN_API_KEY           API key for the table store
    WARDEN_SIGNING_SECRET    Shared HMAC secret used to verify commands

EXAMPLES:
    warden-agent                               # uses {DEFAULT_CONFIG_PATH}
    warden-agent /etc/warden/worker.toml       # custom config path
    warden-agent --check-config                # validate and exit
    RUST_LOG=debug warden-agent                # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

fn print_summary(config: &Config) {
    println!("Configuration OK");
    println!("  backend:   {}", config.backend.url);
    println!(
        "  worker:    project {} / node {}",
        config.worker.project_id, config.worker.node_id
    );
    println!(
        "  polling:   every {}ms, batch {}, max backoff {}s",
        config.worker.poll_interval_ms, config.worker.batch_size, config.worker.max_backoff_secs
    );
    println!("  signing:   {}", config.signing.schemes.join(", "));
    println!("  sandbox:   {}", config.sandbox.root.display());
    if config.shell.allowlist.is_empty() {
        println!("  shell:     (no programs allowlisted)");
    } else {
        println!(
            "  shell:     {} (timeout {}s)",
            config.shell.allowlist.join(", "),
            config.shell.timeout_secs
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut check_only = false;
    let mut config_path = None;

    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("warden-agent v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--check-config" => check_only = true,
            _ if arg.starts_with('-') => {
                eprintln!("Unknown option: {arg} (see --help)");
                std::process::exit(2);
            }
            _ => config_path = Some(arg),
        }
    }
    let config_path = config_path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    if check_only {
        match Config::load(&config_path) {
            Ok(config) => {
                print_summary(&config);
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("Invalid configuration {config_path}: {e:#}");
                std::process::exit(1);
            }
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warden_agent=info,security=info")),
        )
        .init();

    info!("warden-agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from {config_path}");
    let config = Arc::new(Config::load(&config_path)?);

    info!("Backend: {}", config.backend.url);
    info!(
        "Worker: project {} / node {}",
        config.worker.project_id, config.worker.node_id
    );
    info!("Sandbox root: {}", config.sandbox.root.display());
    info!("Signature schemes: {}", config.signing.schemes.join(", "));
    if config.shell.allowlist.is_empty() {
        warn!("Shell allowlist is empty, shell.exec will reject every program");
    } else {
        info!("Shell allowlist: {}", config.shell.allowlist.join(", "));
    }

    let backend = Arc::new(RestBackend::new(&config.backend)?);
    let worker = Worker::new(config.clone(), backend)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received, finishing current command"),
                Err(e) => error!("Cannot listen for shutdown signal: {e}"),
            }
            shutdown.cancel();
        });
    }

    worker.run(shutdown).await
}
