// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use sekia_bus::external::NatsBus;
use sekia_bus::{embedded::EmbeddedBus, Bus};
use sekia_config::{load_config, validate_config, warn_on_secrets, BusMode, RuntimeSecrets};
use sekia_daemon::{build_app, spawn_heartbeat_listener, AgentRegistry, AppState};
use sekia_engine::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sekiad", version, about = "Sekia workflow daemon")]
struct Args {
    /// Path to the daemon's TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref()).context("loading configuration")?;

    let filter = config
        .log_level
        .as_deref()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let warnings = validate_config(&config).context("validating configuration")?;
    for warning in &warnings {
        warn!("{warning}");
    }

    let secrets = RuntimeSecrets::from_env();
    for warning in warn_on_secrets(&secrets) {
        warn!("{warning}");
    }

    let bus: Arc<dyn Bus> = match config.bus_mode {
        BusMode::Embedded => Arc::new(EmbeddedBus::new()),
        BusMode::Nats => {
            let url = config
                .bus_url
                .clone()
                .context("bus_mode = \"nats\" requires bus_url")?;
            Arc::new(
                NatsBus::connect(&url, secrets.nats_token.as_deref())
                    .await
                    .context("connecting to NATS")?,
            )
        }
    };

    let engine = Arc::new(Engine::new(&config, bus.clone(), Arc::new(secrets.command_secret), None));
    engine.start().await.context("loading workflows")?;

    let agents = AgentRegistry::new();
    let heartbeat_task = spawn_heartbeat_listener(bus.clone(), agents.clone());
    let reload_task = engine.clone().spawn_reload_listener();

    let state = Arc::new(AppState {
        engine: engine.clone(),
        started_at: chrono::Utc::now(),
        agents,
    });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("bind {}", config.bind_address))?;
    info!(bind = %config.bind_address, "sekiad listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    info!("shutting down, draining workflows");
    heartbeat_task.abort();
    reload_task.abort();
    engine.shutdown(Duration::from_secs(config.reload_grace_secs)).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
