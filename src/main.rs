// Switchboard - Multi-provider LLM dispatch service
// Copyright (c) 2025-2026 A00 SASU
// License: AGPL-3.0-only
// See LICENSE for details

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use switchboard::config::AppConfig;
use switchboard::dispatch::{EndpointRegistry, ProviderManager};
use switchboard::server;
use switchboard::storage::{ConfigDb, ConfigStore};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Multi-provider LLM dispatch service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ~/.switchboard/config.toml)
    #[arg(short, long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher and admin surface in the foreground
    Run {
        #[arg(short, long, env = "SWITCHBOARD_PORT")]
        port: Option<u16>,
        #[arg(long, env = "SWITCHBOARD_HOST")]
        host: Option<String>,
        #[arg(long, env = "SWITCHBOARD_LOG_LEVEL")]
        log_level: Option<String>,
        #[arg(long, env = "SWITCHBOARD_JSON_LOGS")]
        json_logs: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path)?;

    let Commands::Run {
        port,
        host,
        log_level,
        json_logs,
    } = cli.command;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(log_level.as_deref().unwrap_or(&config.server.log_level))
    });
    if json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    cmd_run(config, port, host).await
}

async fn cmd_run(config: AppConfig, port: Option<u16>, host: Option<String>) -> anyhow::Result<()> {
    let db_path = config
        .storage
        .path
        .clone()
        .unwrap_or_else(ConfigDb::default_path);
    let store: Arc<dyn ConfigStore> = Arc::new(ConfigDb::open(&db_path)?);
    info!(path = %db_path.display(), "config store opened");

    let registry = Arc::new(EndpointRegistry::new(store.clone()));

    // First run: seed the empty store from the config file.
    if !config.providers.is_empty() && store.list_all().await?.is_empty() {
        info!(count = config.providers.len(), "seeding provider configs from file");
        registry.replace_configs(config.providers.clone()).await?;
    }

    let manager = Arc::new(
        ProviderManager::new(registry).with_probe_interval(Duration::from_secs(
            config.dispatch.probe_interval_seconds.max(1),
        )),
    );
    manager.start()?;

    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin surface listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal.cancel();
    });

    axum::serve(listener, server::admin_router(manager.clone()))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    manager.stop().await;
    Ok(())
}
