//! usbmouse
//!
//! Drives USB HID boot-protocol mice through libusb and prints the decoded
//! pointer and button reports.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{DriverBridge, DriverCommand, DriverEvent, create_driver_bridge, setup_logging};
use protocol::MouseInfo;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use usbmouse::config::{DriverConfig, OutputFormat};
use usbmouse::usb::{enumerate_boot_mice, spawn_driver_worker};

/// How long startup waits for the worker's device list
const LIST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "usbmouse")]
#[command(author, version, about = "USB boot-protocol mouse driver")]
#[command(long_about = "
Claims USB HID boot-protocol mice, keeps an interrupt transfer in flight for
each of them, and prints every decoded report.

EXAMPLES:
    # Run with default config
    usbmouse

    # Print reports as JSON lines
    usbmouse --json

    # List boot mice without claiming them
    usbmouse --list-devices

    # Run with debug logging
    usbmouse --log-level debug

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbmouse/driver.toml
    3. /etc/usbmouse/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List boot mice and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print reports as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        DriverConfig::load(Some(DriverConfig::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbmouse v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        return list_devices_mode().await;
    }

    let output = if args.json {
        OutputFormat::Json
    } else {
        config.driver.output
    };

    let (bridge, worker) = create_driver_bridge(config.driver.event_queue_depth);
    let worker_handle =
        spawn_driver_worker(worker, config).context("Failed to spawn USB worker thread")?;

    report_attached(&bridge).await;

    let result = run(bridge.clone(), output).await;

    info!("Shutting down USB subsystem...");
    if let Err(e) = bridge.send_command(DriverCommand::Shutdown).await {
        error!("Error shutting down USB worker: {:#}", e);
    }

    // Drain detach notices until the worker drops its event sender
    while let Ok(event) = bridge.recv_event().await {
        print_event(&event, output);
    }

    match worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker failed: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    result
}

/// List boot mice and exit
async fn list_devices_mode() -> Result<()> {
    info!("Listing boot mice...");

    let mice = tokio::task::spawn_blocking(enumerate_boot_mice)
        .await
        .context("Device enumeration task failed")?
        .context("Failed to enumerate USB devices")?;

    if mice.is_empty() {
        println!("No boot mice found.");
    } else {
        println!("Found {} boot mouse/mice:\n", mice.len());
        for mouse in mice {
            print_mouse(&mouse);
            println!();
        }
    }

    Ok(())
}

/// Log the mice the worker attached during its initial scan
async fn report_attached(bridge: &DriverBridge) {
    let (tx, rx) = oneshot::channel();
    if let Err(e) = bridge
        .send_command(DriverCommand::ListDevices { response: tx })
        .await
    {
        warn!("Cannot query USB worker: {:#}", e);
        return;
    }

    // Events are not drained yet, so a worker blocked on publishing must not hang startup
    let mice = match tokio::time::timeout(LIST_TIMEOUT, rx).await {
        Ok(Ok(mice)) => mice,
        Ok(Err(_)) => {
            warn!("USB worker stopped before listing devices");
            return;
        }
        Err(_) => {
            warn!("USB worker did not answer within {:?}", LIST_TIMEOUT);
            return;
        }
    };

    if mice.is_empty() {
        info!("No boot mice attached yet");
    }
    for mouse in &mice {
        info!(
            "Driving {} at {} ({}, {})",
            mouse.name,
            mouse.location,
            mouse.phys,
            if mouse.opened { "polling" } else { "idle" }
        );
    }
}

/// Print events until Ctrl+C or until the worker stops
async fn run(bridge: DriverBridge, output: OutputFormat) -> Result<()> {
    info!("Press Ctrl+C to stop");

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
                    Ok(event) => print_event(&event, output),
                    Err(_) => return Err(anyhow!("USB worker stopped unexpectedly")),
                }
            }
        }
    }
}

fn print_mouse(mouse: &MouseInfo) {
    println!(
        "  [{}] {:04x}:{:04x} - {}",
        mouse.location, mouse.vendor_id, mouse.product_id, mouse.name
    );
    println!("      {}", mouse.phys);
}

fn print_event(event: &DriverEvent, output: OutputFormat) {
    match output {
        OutputFormat::Json => {
            let value = match event {
                DriverEvent::DeviceAttached { device } => serde_json::json!({
                    "event": "attached",
                    "device": device,
                }),
                DriverEvent::DeviceDetached { location, phys } => serde_json::json!({
                    "event": "detached",
                    "location": location,
                    "phys": phys,
                }),
                DriverEvent::Report { phys, report } => serde_json::json!({
                    "event": "report",
                    "phys": phys,
                    "report": report,
                }),
            };
            println!("{}", value);
        }
        OutputFormat::Text => match event {
            DriverEvent::DeviceAttached { device } => {
                println!("attached: {} ({})", device.name, device.phys);
            }
            DriverEvent::DeviceDetached { location, phys } => {
                println!("detached: {} ({})", phys, location);
            }
            DriverEvent::Report { phys, report } => {
                let b = &report.buttons;
                println!(
                    "{}: buttons=[{}{}{}{}{}] dx={:+} dy={:+} wheel={:+}",
                    phys,
                    if b.left { 'L' } else { '-' },
                    if b.right { 'R' } else { '-' },
                    if b.middle { 'M' } else { '-' },
                    if b.side { 'S' } else { '-' },
                    if b.extra { 'E' } else { '-' },
                    report.dx,
                    report.dy,
                    report.wheel
                );
            }
        },
    }
}
