use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use plugin_gateway::commands;
use plugin_gateway::config;
use plugin_gateway::web;
use plugin_gateway::PluginGateway;

#[derive(Parser, Debug)]
#[command(name = "plugin-gateway")]
#[command(about = "Plugin gateway with circuit breaking and rate limiting", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the gateway (default)
    Run,
    /// Validate configuration and print a summary
    Check,
}

fn init_tracing(debug: bool, json: bool) -> anyhow::Result<()> {
    let log_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("plugin_gateway={log_level}").parse()?);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.json_logs)?;

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)
                .await
                .with_context(|| format!("failed to load configuration from {}", path.display()))?
        }
        None => {
            info!("Loading configuration from default locations");
            config::load_from_env_or_file()
                .await
                .context("failed to load configuration")?
        }
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Check => {
            commands::run_config_check(config).await?;
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: config::Config) -> anyhow::Result<()> {
    info!("Starting plugin gateway");
    info!(
        "Max plugins: {}, {} preloaded, discovery: {}",
        config.max_plugins,
        config.plugins.len(),
        config.discovery.provider
    );

    let http = config.http.clone();
    let gateway = Arc::new(PluginGateway::from_config(config)?);
    gateway.start().await.context("failed to start gateway")?;

    let shutdown = CancellationToken::new();
    let server = if http.enabled {
        let gateway = gateway.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = web::start_server(gateway, &http, token).await {
                error!("HTTP server error: {}", e);
            }
        }))
    } else {
        info!("HTTP surface disabled");
        None
    };

    shutdown_signal().await;
    info!("Shutting down...");

    shutdown.cancel();
    if let Some(server) = server {
        if let Err(e) = server.await {
            error!("HTTP server task failed: {}", e);
        }
    }
    gateway.stop().await;

    info!("Plugin gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
