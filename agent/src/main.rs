//! Piped - Entry Point
//!
//! The deployment agent of the continuous-delivery control plane. Runs
//! inside or near a customer environment, pulls work from the central API,
//! and executes multi-stage deployment pipelines.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use piped::app::options::AppOptions;
use piped::app::run::run;
use piped::config::piped::PipedConfig;
use piped::logs::{init_logging, LogOptions};
use piped::utils::version_info;
use piped::workers;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => eprintln!("failed to render version info: {}", e),
        }
        return;
    }

    // Load the configuration file
    let Some(config_path) = cli_args.get("config-file") else {
        eprintln!("usage: piped-agent --config-file=<path>");
        std::process::exit(2);
    };
    let config = match PipedConfig::load(Path::new(config_path)).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("unable to load configuration from {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: config.log_level,
        json_format: cli_args.contains_key("json-logs"),
    };
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    // Build options from the configuration
    let options = AppOptions {
        trigger_worker: workers::trigger::Options {
            sync_interval: config.sync_interval(),
            ..Default::default()
        },
        ..Default::default()
    };

    info!("running piped {} for project {}", version.version, config.project_id);
    let result = run(version.version, config, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("failed to run the agent: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
