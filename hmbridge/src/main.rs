//! Homematic RPC event bridge.
//!
//! Registers with every configured controller, keeps the device registry up
//! to date and logs events until Ctrl+C.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use hmbridge_common::init_tracing;
use hmbridge_core::{Bridge, HmBridgeConfig, SystemEvent};

/// Event bridge for Homematic CCU and Homegear controllers.
#[derive(Parser, Debug)]
#[command(name = "hmbridge")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, default_value = "hmbridge.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = HmBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_tracing(&config.logging).context("Failed to initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        remotes = config.remotes.len(),
        "Starting hmbridge"
    );

    let mut bridge = Bridge::builder(config)
        .on_event(|event| {
            info!(
                interface_id = %event.interface_id,
                address = %event.address,
                key = %event.key,
                value = %event.value,
                "Event"
            );
        })
        .on_system(|event| match event {
            SystemEvent::Error {
                interface_id,
                code,
                message,
            } => warn!(interface_id = %interface_id, code, message = %message, "Controller error"),
            other => info!(event = ?other, "System event"),
        })
        .build()
        .context("Invalid configuration")?;

    bridge.connect().await.context("Failed to connect to any remote")?;
    bridge.run().await.context("Bridge failed")?;

    info!("Goodbye!");
    Ok(())
}
