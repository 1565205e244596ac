//! meshircd - a federating TS6-style IRC daemon.
//!
//! One event-loop task owns all network state; everything else (accept
//! loops, per-connection I/O, the one-second timer, signal handling,
//! outbound dials) communicates with it through queues.

mod config;
mod daemon;
mod error;
mod event;
mod flood;
mod handlers;
mod network;
mod state;
mod sync;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::config::Config;
use crate::daemon::Daemon;
use crate::event::Event;
use crate::state::ClientIdAllocator;

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path; falls back to
/// `config.toml`.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };

    // Canonicalize so REHASH does not depend on the working directory.
    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();

    let conf = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: Failed to load config from {}: {}", config_path, e);
        e
    })?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    if let Err(errors) = config::validate(&conf) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    info!(
        server = %conf.server.name,
        sid = %conf.server.sid,
        "Starting meshircd"
    );

    // Bind before daemonizing anything: a bad listener is a startup error.
    let listeners = network::listener::bind(&conf).await?;

    let ids = Arc::new(ClientIdAllocator::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel::<Event>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Signals: SIGHUP rehashes, SIGINT/SIGTERM shut down.
    {
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
            let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
            let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

            loop {
                tokio::select! {
                    _ = sighup.recv() => {
                        info!("SIGHUP received, scheduling rehash");
                        if events_tx.send(Event::Rehash).is_err() {
                            break;
                        }
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down");
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down");
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }
        });
    }

    // The once-per-second tick drives pings, link attempts, and flood
    // token refills.
    {
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if events_tx.send(Event::Tick).is_err() {
                    break;
                }
            }
        });
    }

    network::listener::spawn_acceptors(listeners, ids.clone(), events_tx.clone(), shutdown_rx.clone());

    let daemon = Daemon::new(conf, config_path, ids, events_tx);
    daemon.run(events_rx, shutdown_rx).await;

    // Give write tasks a moment to flush closing ERRORs.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    info!("Shutdown complete");

    Ok(())
}
