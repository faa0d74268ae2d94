//! Simulated Modbus-TCP device entry point.
//!
//! # Usage
//!
//! ```text
//! mbgw-device <UNIT_ID> [OPTIONS]
//!
//! Options:
//!   --port <PORT>           TCP port to listen on [default: 5021]
//!   --bind <IP>             Address to bind [default: 0.0.0.0]
//!   --registers <N>         Number of holding registers [default: 100]
//!   --exit-on-disconnect    Stop once the gateway disconnects
//! ```
//!
//! Then point the gateway at it: `GET /connect?id=<UNIT_ID>&port=5021`.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mbgw_device::infrastructure::server::DEFAULT_PORT;
use mbgw_device::infrastructure::{DeviceSimulator, SimulatorConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Simulated Modbus-TCP device.
#[derive(Debug, Parser)]
#[command(
    name = "mbgw-device",
    about = "Simulated Modbus-TCP device answering 0x03 and 0x10",
    version
)]
struct Cli {
    /// Unit id this device answers as.
    unit_id: u8,

    #[arg(long, default_value_t = DEFAULT_PORT, env = "MBGW_DEVICE_PORT")]
    port: u16,

    /// IP address to bind to.  `0.0.0.0` accepts connections on every interface.
    #[arg(long, default_value = "0.0.0.0", env = "MBGW_DEVICE_BIND")]
    bind: String,

    /// Number of holding registers; register `i` starts at value `i`.
    #[arg(long, default_value_t = 100)]
    registers: usize,

    /// Exit when the connected gateway goes away.
    #[arg(long)]
    exit_on_disconnect: bool,
}

impl Cli {
    /// # Errors
    ///
    /// Returns an error if `--bind` is not a valid IP address.
    fn into_config(self) -> anyhow::Result<SimulatorConfig> {
        let bind_addr: SocketAddr = format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid bind address: '{}:{}'", self.bind, self.port))?;

        Ok(SimulatorConfig {
            unit_id: self.unit_id,
            bind_addr,
            register_count: self.registers,
            exit_on_disconnect: self.exit_on_disconnect,
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config()?;
    info!(
        unit_id = config.unit_id,
        registers = config.register_count,
        "Modbus device simulator starting"
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let simulator = DeviceSimulator::bind(config).await?;
    simulator.run(running).await?;

    info!("Modbus device simulator stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
