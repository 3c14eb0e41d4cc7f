mod cli;
mod format;
mod shutdown;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use simfleet_core::config::{catalog_path, config_path, load_config_from, save_config_to};
use simfleet_engine::remote::{discover_resources, disk_space};
use simfleet_engine::{
    CatalogStore, Connector, EngineConfig, EngineEvent, JsonCatalogStore, SshConnector,
    start_engine,
};

use crate::cli::Cli;
use crate::format::{format_kib_used_total, format_outcome_line};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Prints what every server and archive of the catalog reports, without scheduling anything.
async fn run_probe(store: &dyn CatalogStore, connector: &dyn Connector) -> anyhow::Result<()> {
    let catalog = store.load().await.context("load catalog")?;

    for server in &catalog.servers {
        let channel = match connector.connect(&server.endpoint()).await {
            Ok(channel) => channel,
            Err(err) => {
                println!("server {} ({}): unreachable: {err}", server.id, server.address);
                continue;
            }
        };
        match discover_resources(channel.as_ref()).await {
            Ok(gpus) => {
                println!(
                    "server {} ({}): {} device(s), {} in catalog",
                    server.id,
                    server.address,
                    gpus.len(),
                    catalog.resources_of(server.id).len()
                );
                for gpu in gpus {
                    println!("  GPU {}: {} ({})", gpu.device_id, gpu.name, gpu.uuid);
                }
            }
            Err(err) => println!("server {} ({}): discovery failed: {err}", server.id, server.address),
        }
        channel.close().await;
    }

    for archive in &catalog.archives {
        let channel = match connector.connect(&archive.endpoint()).await {
            Ok(channel) => channel,
            Err(err) => {
                println!("archive {} ({}): unreachable: {err}", archive.id, archive.address);
                continue;
            }
        };
        match disk_space(channel.as_ref(), &archive.working_directory).await {
            Ok(Some(space)) => {
                if let Err(err) = store
                    .record_archive_space(archive.id, space.used_kib, space.total_kib)
                    .await
                {
                    warn!(archive_id = archive.id, error = %err, "cannot record archive capacity");
                }
                let mut refreshed = archive.clone();
                refreshed.space_used = space.used_kib;
                refreshed.space_total = space.total_kib;
                println!(
                    "archive {} ({}): {} used ({:.1}%)",
                    archive.id,
                    archive.address,
                    format_kib_used_total(space.used_kib, space.total_kib),
                    refreshed.usage_percent()
                );
            }
            Ok(None) => println!("archive {} ({}): unrecognised df output", archive.id, archive.address),
            Err(err) => println!("archive {} ({}): df failed: {err}", archive.id, archive.address),
        }
        channel.close().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config_file = match &cli.config {
        Some(path) => path.clone(),
        None => config_path()?,
    };
    let mut cfg = load_config_from(&config_file)
        .with_context(|| format!("load config {}", config_file.display()))?;
    cli.apply(&mut cfg);
    if cli.save_config {
        save_config_to(&config_file, &cfg)
            .with_context(|| format!("save config {}", config_file.display()))?;
        info!(path = %config_file.display(), "config saved");
    }

    let catalog_file = match &cli.catalog {
        Some(path) => path.clone(),
        None => catalog_path()?,
    };
    let store = Arc::new(
        JsonCatalogStore::open(catalog_file.clone())
            .with_context(|| format!("open catalog {}", catalog_file.display()))?,
    );
    let connector = Arc::new(SshConnector::new(cfg.ssh.clone()));

    if cli.probe {
        return run_probe(store.as_ref(), connector.as_ref()).await;
    }

    let engine = start_engine(EngineConfig::from_fleet(&cfg), store, connector).await?;
    let mut events = engine.subscribe();

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    let snapshot = engine.snapshot();
    println!(
        "simfleet {} resources={} queued={}",
        env!("CARGO_PKG_VERSION"),
        snapshot.resources.len(),
        snapshot.queued
    );

    let mut immediate_exit = false;
    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!("Stop requested; running simulations continue remotely and are resumed on the next start (press CTRL+C again to exit immediately).");
                        engine.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("Stop requested again; exiting immediately.");
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match evt {
                    EngineEvent::Started
                    | EngineEvent::StopRequested
                    | EngineEvent::WorkerStage { .. }
                    | EngineEvent::InstanceClaimed { .. } => {}
                    EngineEvent::InstanceLaunched { resource, instance_id, pid } => {
                        println!("instance {instance_id} launched on {resource} (pid {pid})");
                    }
                    EngineEvent::InstanceFinished { outcome } => {
                        println!("{}", format_outcome_line(&outcome));
                        for failure in &outcome.archives_failed {
                            eprintln!("  {failure}");
                        }
                    }
                    EngineEvent::Warning { message } | EngineEvent::Error { message } => {
                        eprintln!("{message}");
                    }
                    EngineEvent::Stopped => break,
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }

    engine.wait().await?;
    Ok(())
}
