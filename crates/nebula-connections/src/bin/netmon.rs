//! `netmon`: connect to a set of worlds and report on their health.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p nebula-connections --bin netmon -- --world Alpha=ws://localhost:9000`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nebula_config::{CliArgs, Config};
use nebula_connections::{
    ConnectionRegistry, FileStore, KeyValueStore, MemoryStore, ProtocolKind, RegistryConfig,
    RegistryEvent, TransportConnector, WorldDescriptor, policy_from_config,
};
use nebula_net::{TransportClient, TransportConfig, UdpRouteProbe};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

fn log_event(event: &RegistryEvent) {
    let world = event.world_id();
    match event {
        RegistryEvent::StatusChanged { record, previous }
            if previous.is_active() && !record.status.is_active() =>
        {
            warn!(
                "{world} went {} from {previous}: {}",
                record.status,
                record.statistics.last_error.as_deref().unwrap_or("no error recorded")
            );
        }
        RegistryEvent::StatusChanged { record, previous } => {
            debug!("{world}: {previous} -> {}", record.status);
        }
        RegistryEvent::Removed { entry, .. } => info!(
            "{world} finished after {}s (connected: {})",
            entry.duration.as_secs(),
            entry.success
        ),
        RegistryEvent::Added(_) | RegistryEvent::StatisticsUpdated(_) => {}
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args
        .config
        .clone()
        .or_else(nebula_config::default_config_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);
    if let Err(e) = config.validate() {
        eprintln!("Invalid config: {e}, using defaults");
        config = Config::default();
        config.apply_cli_overrides(&args);
    }

    let log_dir = config_dir.join("logs");
    nebula_log::init_logging(Some(&log_dir), config.debug.log_to_file, Some(&config));

    let worlds = match args.parsed_worlds() {
        Ok(worlds) => worlds,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };
    if worlds.is_empty() {
        warn!("No worlds given; pass --world NAME=URL to connect to one");
    }

    let client = match TransportClient::new(TransportConfig::from(&config.network)) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to start transport: {e}");
            std::process::exit(1);
        }
    };
    match config.network.reachability_target.parse::<SocketAddr>() {
        Ok(target) => client.monitor_path(UdpRouteProbe::new(target)).await,
        Err(e) => warn!("Reachability monitoring disabled: {e}"),
    }

    let store: Arc<dyn KeyValueStore> = match args.data_dir.clone().or_else(nebula_config::default_data_dir) {
        Some(dir) => {
            info!("Connection history in {}", dir.display());
            Arc::new(FileStore::new(dir))
        }
        None => {
            warn!("No data directory available; history will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let registry = ConnectionRegistry::spawn(
        Arc::new(TransportConnector::new(Arc::clone(&client))),
        store,
        RegistryConfig::from(&config.connections),
        policy_from_config(&config.connections),
    );

    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("Event log skipped {missed} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for (name, url) in worlds {
        let protocol = ProtocolKind::for_url(&url);
        if let Err(e) = registry
            .add_connection(WorldDescriptor::new(name.as_str(), url, protocol))
            .await
        {
            warn!("Could not add {name}: {e}");
        }
    }

    let period = Duration::from_secs(args.report_interval.max(1));
    let mut reports = tokio::time::interval(period);
    reports.tick().await;

    loop {
        tokio::select! {
            _ = reports.tick() => {
                let report = registry.generate_report(period).await;
                info!("\n{report}");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    registry.shutdown().await;
    client.stop_path_monitor().await;
    client.close_all().await;
}
