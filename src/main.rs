use anyhow::Context;
use clap::Parser;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use minetrap::config_loader::Config;
use minetrap::honeypot_log::HoneypotLogger;
use minetrap::logger;
use minetrap::rate_limiter::RateLimiter;
use minetrap::server::Server;
use minetrap::upstream::UpstreamMirror;

#[derive(Parser, Debug)]
#[command(
    name = "minetrap",
    version,
    about = "A deceptive Minecraft endpoint that records scanners and tar-pits login attackers"
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config =
        Arc::new(Config::load(&args.config).context("failed to load configuration")?);
    logger::init(&config.logging);

    info!(
        "starting minetrap {} (config {})",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let limiter = Arc::new(RateLimiter::new(config.clone()));
    tokio::spawn(limiter.clone().run_sweeper(shutdown_rx.clone()));

    let mirror = Arc::new(UpstreamMirror::new(config.clone()));
    tokio::spawn(mirror.clone().run(shutdown_rx.clone()));

    let honeypot = Arc::new(
        HoneypotLogger::from_config(&config.honeypot_logging)
            .context("failed to open the honeypot event log")?,
    );
    if honeypot.is_enabled() {
        info!(
            "recording honeypot events to {} ({})",
            config.honeypot_logging.file_path, config.honeypot_logging.format
        );
    }

    let server = Server::bind(config.clone(), limiter.clone(), mirror, honeypot)
        .await
        .context("failed to bind listener")?;
    let server_task = tokio::spawn(server.run(shutdown_rx.clone()));

    tokio::spawn(monitor_rate_limiter(limiter, shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received, draining sessions");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(10), server_task).await {
        Ok(Ok(())) => info!("server stopped"),
        Ok(Err(err)) => error!("server task failed: {}", err),
        Err(_) => warn!("server did not stop within the drain window"),
    }
    Ok(())
}

/// Periodic telemetry: surfaces global saturation (the circuit-breaker
/// read) and limiter counters. Observation only; admission behavior is
/// never changed from here.
async fn monitor_rate_limiter(limiter: Arc<RateLimiter>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = limiter.stats();
                if limiter.is_circuit_breaker_triggered() {
                    warn!(
                        "global rate limit exhausted ({} admitted over {:?}, {} active sources)",
                        stats.total_admitted, stats.uptime, stats.active_ips
                    );
                } else {
                    debug!(
                        "limiter: {} admitted, {} active sources",
                        stats.total_admitted, stats.active_ips
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Waits for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c"),
            Err(err) => error!("failed to listen for ctrl-c: {}", err),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received sigterm");
            }
            Err(err) => error!("failed to listen for sigterm: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
