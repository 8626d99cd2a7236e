//! ESPHome vehicle bridge.
//!
//! Serves the vehicle HTTP API and publishes telemetry to Zenoh. The
//! shipped binary drives the built-in simulated vehicle backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use espbridge::EspBridgeConfig;
use espbridge::simulator::SimulatedConnector;
use espbridge_framework::{BridgeArgs, BridgeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("espbridge.json5");

    let config = EspBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if args.check {
        println!(
            "{}: OK ({} device(s))",
            args.config.display(),
            config.devices.len()
        );
        return Ok(());
    }

    let connector = Arc::new(SimulatedConnector::new(config.simulator.clone()));

    espbridge::run_bridge(config, Some(&args), connector)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}
