//! osrfx2d
//!
//! Attaches every OSR FX2 board on the bus, keeps them attached across
//! hot-plug, and logs switch changes until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use common::{DriverBridge, DriverCommand, DriverEvent, SwitchState, create_driver_bridge, setup_logging};
use osrfx2::config::{self, DriverConfig};
use osrfx2::usb::spawn_usb_worker;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "osrfx2d")]
#[command(author, version, about = "OSR FX2 board driver daemon")]
#[command(long_about = "
Attaches OSR FX2 learning boards, exposes each as osrfx2_<n>, and logs
switch-pack changes as the boards report them.

EXAMPLES:
    # Run with default config
    osrfx2d

    # List attached boards as JSON and exit
    osrfx2d --list-devices --json

    # Run with debug logging
    osrfx2d --log-level debug

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/osrfx2/osrfx2.toml
    3. /etc/osrfx2/osrfx2.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List attached boards and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the device list as JSON
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("osrfx2d v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let (bridge, worker) = create_driver_bridge();
    let worker_handle =
        spawn_usb_worker(worker, config.clone()).context("Failed to spawn USB worker thread")?;

    let result = if args.list_devices {
        list_devices_mode(&bridge, args.json).await
    } else {
        run(&bridge).await
    };

    info!("Shutting down USB subsystem...");
    if let Err(e) = bridge.send_command(DriverCommand::Shutdown).await {
        error!("Error shutting down USB worker: {}", e);
    }

    match worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker failed: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    result
}

async fn list_devices_mode(bridge: &DriverBridge, json: bool) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(DriverCommand::ListDevices { response: tx })
        .await
        .context("Failed to send ListDevices command")?;

    let devices = rx.await.context("Failed to receive device list")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&devices).context("Failed to serialize device list")?
        );
        return Ok(());
    }

    if devices.is_empty() {
        println!("No OSR FX2 boards attached.");
    } else {
        println!("Found {} board(s):\n", devices.len());
        for device in devices {
            println!(
                "  [{}] {}  switches {}",
                device.id, device.node_name, device.switches
            );
            println!(
                "      Bus {:03} Device {:03}",
                device.bus_number, device.device_address
            );
        }
    }

    Ok(())
}

/// Log driver events and switch changes until Ctrl+C
async fn run(bridge: &DriverBridge) -> Result<()> {
    info!("Press Ctrl+C to shutdown");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
            event = bridge.recv_event() => {
                match event {
                    Ok(event) => handle_event(event),
                    Err(e) => {
                        warn!("USB worker went away: {}", e);
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn handle_event(event: DriverEvent) {
    match event {
        DriverEvent::DeviceAttached {
            id,
            node_name,
            switches,
        } => {
            info!("{} ({}) ready", node_name, id);
            tokio::spawn(watch_switches(node_name, switches));
        }
        DriverEvent::AttachFailed {
            bus_number,
            device_address,
            reason,
        } => {
            warn!(
                "Board on bus {:03} address {:03} not attached: {}",
                bus_number, device_address, reason
            );
        }
        DriverEvent::DeviceDetached { id } => {
            debug!("Device {} detached", id);
        }
    }
}

/// Log every switch change on one board until its context goes away
async fn watch_switches(node_name: String, mut switches: watch::Receiver<u8>) {
    let mut last = *switches.borrow_and_update();

    while switches.changed().await.is_ok() {
        let state = *switches.borrow_and_update();
        if state != last {
            info!("{} switches: {}", node_name, SwitchState(state));
            last = state;
        }
    }

    debug!("Stopped watching {}", node_name);
}
