// src/main.rs

//! Entry point for the `keepered` binary: parses a small set of flags,
//! loads and validates the TOML configuration, wires up a reloadable
//! `tracing` subscriber, then hands off to the control-loop runtime.

use std::env;
use std::sync::Arc;

use anyhow::Result;
use keepered::config::Config;
use keepered::core::runtime;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--version") {
        println!("keepered version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("keepered.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    if args.iter().any(|a| a == "--validate-config") {
        println!("configuration at \"{config_path}\" is valid");
        return Ok(());
    }

    // Reloadable filter layer: SIGHUP re-reads the config file and pushes any
    // changed `log_level` through this handle without restarting the process.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let reload_handle = Arc::new(reload_handle);

    if let Err(e) = runtime::run(config, reload_handle).await {
        error!("supervisor runtime error: {e}");
        std::process::exit(1);
    }

    Ok(())
}
