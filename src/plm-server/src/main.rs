// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use plm_app::{init_logging, normalize_name};
use plm_backend::{register_builtin_transports_on, TransportAccess, TransportRegistry};
use plm_core::{DeviceAddress, Driver, DriverListener, DynResult, HandlerRegistry, Msg};

use config::ServerConfig;

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - powerline modem driver daemon");

#[derive(Debug, Parser)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Modem transport to use (e.g. loopback, null)
    #[arg(short = 't', long = "transport")]
    transport: Option<String>,
    /// Log level override (trace, debug, info, warn, error)
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

/// Logs everything the driver publishes.
struct LogListener;

impl DriverListener for LogListener {
    fn on_message_published(&self, device: DeviceAddress, msg: &Msg) {
        info!("{}: {}", device, msg);
    }

    fn on_query_answered(&self, device: DeviceAddress, feature: &str) {
        debug!("{}: {} answered", device, feature);
    }
}

fn resolve_transport(
    cli: &Cli,
    cfg: &ServerConfig,
    registry: &TransportRegistry,
) -> DynResult<String> {
    let name = normalize_name(cli.transport.as_deref().unwrap_or(&cfg.modem.transport));
    if !registry.is_transport_registered(&name) {
        return Err(format!(
            "Unknown transport: {} (available: {})",
            name,
            registry.registered_transports().join(", ")
        )
        .into());
    }
    Ok(name)
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", ServerConfig::example_combined_toml());
        return Ok(());
    }

    let (cfg, config_path) = ServerConfig::resolve(cli.config.as_deref())?;

    init_logging(cli.log_level.as_deref().or(cfg.general.log_level.as_deref()));

    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let mut transports = TransportRegistry::new();
    register_builtin_transports_on(&mut transports);
    let transport_name = resolve_transport(&cli, &cfg, &transports)?;

    let handlers = HandlerRegistry::with_builtin();
    let mut devices = Vec::with_capacity(cfg.devices.len());
    for device in &cfg.devices {
        let features = handlers
            .build_features(&device.features)
            .map_err(|e| format!("device {}: {}", device.address, e))?;
        devices.push((device, features));
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = transports.build_transport(
        &transport_name,
        TransportAccess {
            events: events_tx,
            modem: cfg.modem.address,
            reply_delay: Duration::from_millis(cfg.modem.reply_delay_ms),
        },
    )?;

    info!(
        "Starting plm-server (transport: {}, modem: {}, devices: {})",
        transport.name(),
        cfg.modem.address,
        devices.len()
    );

    let driver = Driver::new(cfg.min_poll_spacing());
    for (device, features) in devices {
        driver.add_device(device.address, features, device.battery);
    }
    driver.register_listener(Arc::new(LogListener));
    driver.start(transport, events_rx);

    for device in &cfg.devices {
        match cfg.poll_interval(device) {
            Some(interval) => {
                driver.start_polling(device.address, interval);
            }
            None => debug!("polling disabled for {}", device.address),
        }
    }
    info!("{} devices in poll rotation", driver.poll_queue_size());

    signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    let pending = driver.request_queue_size();
    if pending > 0 {
        warn!("dropping {} scheduled device requests", pending);
    }
    driver.stop().await;

    Ok(())
}
