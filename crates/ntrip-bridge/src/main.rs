mod cli;
mod config;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws_bridge::Bridge;

use crate::cli::Cli;
use crate::config::{Config, LogFormat};

/// How long shutdown waits for live sessions to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let (mut cfg, config_found) = match config::load(&cli.config)? {
        Some(cfg) => (cfg, true),
        None => (Config::default(), false),
    };

    if let Some(ref listen) = cli.listen {
        cfg.network.listen_addr = listen.clone();
    }
    if let Some(port) = cli.port {
        cfg.override_port(port)?;
    }
    if let Some(ref level) = cli.log_level {
        cfg.logging.level = level.clone();
    }

    // 3. Init tracing.
    init_tracing(&cfg);
    if !config_found {
        warn!(
            path = %cli.config.display(),
            "configuration file not found; using defaults"
        );
    }

    let bridge_config = cfg.bridge_config()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_file = %cli.config.display(),
        listen = %bridge_config.listen_addr,
        keepalive = ?bridge_config.session.keepalive_interval,
        connect_timeout = ?bridge_config.session.connect_timeout,
        handshake_timeout = ?bridge_config.session.handshake_timeout,
        "ntrip-bridge starting"
    );

    // 4. Shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx_signal.send(());
    });

    // 5. Serve until shutdown.
    let bridge = Bridge::new(bridge_config, shutdown_tx);
    bridge.run().await.context("bridge listener failed")?;

    // 6. Give sessions a moment to close their clients and casters.
    let registry = bridge.registry();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    info!(
        remaining_sessions = registry.len(),
        drained = drained.is_ok(),
        "ntrip-bridge shutting down"
    );
    Ok(())
}

fn init_tracing(cfg: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    match cfg.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler; only ctrl-c stops the bridge");
                ctrl_c.await.ok();
                info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT (ctrl-c)");
    }
}
