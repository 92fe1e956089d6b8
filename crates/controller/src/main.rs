//! Controller entry point: loads configuration, connects the message bus,
//! constructs State Memory and the Controller Manager, spawns the Catalog
//! Watcher and internal HTTP surface, then waits for a shutdown signal.
//!
//! Signal handling: SIGTERM/SIGINT both trigger the same graceful shutdown
//! path — stop every Control Unit (1s grace each), disconnect the bus, exit.

mod bridge;
mod bus;
mod catalog;
mod catalog_watcher;
mod config;
mod control;
mod manager;
mod rules;
mod state;
mod watchdog;
mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use bus::BusAdapter;
use config::AppConfig;
use manager::Manager;
use state::StateMemory;

#[tokio::main]
async fn main() -> Result<()> {
    config::apply_legacy_log_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = AppConfig::from_env();
    info!(
        mqtt_host = %cfg.mqtt_host,
        mqtt_port = cfg.mqtt_port,
        catalog_dir = %cfg.catalog_dir,
        "starting lab controller"
    );

    let (bus, eventloop) = BusAdapter::connect("lab-controller", &cfg.mqtt_host, cfg.mqtt_port, Duration::from_secs(30));
    let bus_run = bus.clone();
    let mut bus_handle = tokio::spawn(async move {
        bus_run.run(eventloop).await;
    });

    let state = Arc::new(StateMemory::new());
    let manager = Arc::new(Manager::new(
        cfg.catalog_dir.clone(),
        state.clone(),
        bus.clone(),
        cfg.control_loop(),
        cfg.sensor_watchdog(),
    ));
    manager.start().await?;

    let watcher_manager = manager.clone();
    let catalog_refresh = cfg.catalog_refresh();
    let mut catalog_watcher_handle = tokio::spawn(async move {
        catalog_watcher::run(watcher_manager, catalog_refresh).await;
    });

    let mut web_handle = tokio::spawn(web::serve(state.clone(), cfg.http_port));
    let mut web_alive = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;
    loop {
        tokio::select! {
            result = &mut bus_handle => {
                error!("CRITICAL: bus run loop exited unexpectedly: {result:?}");
                exit_reason = "bus task died";
                break;
            }
            result = &mut catalog_watcher_handle => {
                error!("CRITICAL: catalog watcher exited unexpectedly: {result:?}");
                exit_reason = "catalog watcher task died";
                break;
            }
            result = &mut web_handle, if web_alive => {
                warn!("internal http server exited unexpectedly: {result:?}");
                // Not safety-critical; the bus loop and control units still run.
                // Disarm this branch so the already-resolved handle is never polled again.
                web_alive = false;
            }
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }
            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    warn!(signal = exit_reason, "shutting down");
    manager.stop().await;
    info!("shutdown complete");
    Ok(())
}
