//! Modbus-TCP gateway entry point.
//!
//! Loads configuration, connects the configured devices, then serves the
//! HTTP API and the MQTT bridge until Ctrl-C (or SIGTERM on Unix).
//!
//! # Usage
//!
//! ```text
//! mbgw-gateway [OPTIONS]
//!
//! Options:
//!   --config <PATH>             TOML config file [default: mbgw-gateway.toml]
//!   --http-port <PORT>          HTTP listener port
//!   --http-bind <IP>            HTTP bind address
//!   --mqtt-host <HOST>          MQTT broker host
//!   --mqtt-port <PORT>          MQTT broker port
//!   --no-http                   Disable the HTTP API
//!   --no-mqtt                   Disable the MQTT bridge
//!   --uplink-topic <FILTER>     Forward LoRaWAN uplinks from this MQTT filter
//!   --request-timeout-ms <MS>   Caller wait bound per request
//!   --queue-capacity <N>        Per-device queue capacity (100..=1000)
//!   --log-level <FILTER>        Log filter when RUST_LOG is unset
//!   --print-config              Print the effective config as TOML and exit
//! ```
//!
//! Every option can also be set through an `MBGW_*` environment variable
//! (e.g. `MBGW_HTTP_PORT`).  Flags override the config file.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ DeviceRegistry          -- device id → session
//!  └─ RequestRouter           -- shared by both front-ends
//!  └─ DeviceManager           -- connect / disconnect
//!  └─ start services
//!       ├─ MqttBridge     (rumqttc event loop task)
//!       └─ HTTP API       (axum, graceful shutdown)
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mbgw_gateway::application::device_registry::DeviceRegistry;
use mbgw_gateway::application::manage_devices::DeviceManager;
use mbgw_gateway::application::route_request::RequestRouter;
use mbgw_gateway::infrastructure::http_api::{self, ApiState};
use mbgw_gateway::infrastructure::mqtt_bridge::MqttBridge;
use mbgw_gateway::infrastructure::network::TcpConnector;
use mbgw_gateway::infrastructure::storage::config::{self, GatewayConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Modbus-TCP gateway.
///
/// Forwards register reads and writes from HTTP and MQTT callers to
/// Modbus-TCP devices over persistent connections.
#[derive(Debug, Parser)]
#[command(
    name = "mbgw-gateway",
    about = "HTTP/MQTT to Modbus-TCP gateway",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "mbgw-gateway.toml", env = "MBGW_CONFIG")]
    config: PathBuf,

    #[arg(long, env = "MBGW_HTTP_PORT")]
    http_port: Option<u16>,

    /// IP address to bind the HTTP API to.
    #[arg(long, env = "MBGW_HTTP_BIND")]
    http_bind: Option<String>,

    #[arg(long, env = "MBGW_MQTT_HOST")]
    mqtt_host: Option<String>,

    #[arg(long, env = "MBGW_MQTT_PORT")]
    mqtt_port: Option<u16>,

    #[arg(long, env = "MBGW_NO_HTTP")]
    no_http: bool,

    #[arg(long, env = "MBGW_NO_MQTT")]
    no_mqtt: bool,

    /// Enables uplink forwarding from this MQTT topic filter.
    #[arg(long, env = "MBGW_UPLINK_TOPIC")]
    uplink_topic: Option<String>,

    #[arg(long, env = "MBGW_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    #[arg(long, env = "MBGW_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// `tracing` filter used when `RUST_LOG` is unset (e.g. `debug`).
    #[arg(long, env = "MBGW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Loads the config file and applies command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// merged configuration is invalid.
    fn into_config(self) -> anyhow::Result<GatewayConfig> {
        let mut cfg = config::load_config(&self.config)
            .with_context(|| format!("failed to load config from '{}'", self.config.display()))?;
        self.apply_overrides(&mut cfg);
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }

    fn apply_overrides(&self, cfg: &mut GatewayConfig) {
        if let Some(port) = self.http_port {
            cfg.http.port = port;
        }
        if let Some(bind) = &self.http_bind {
            cfg.http.bind_address = bind.clone();
        }
        if let Some(host) = &self.mqtt_host {
            cfg.mqtt.broker_host = host.clone();
        }
        if let Some(port) = self.mqtt_port {
            cfg.mqtt.broker_port = port;
        }
        if self.no_http {
            cfg.http.enabled = false;
        }
        if self.no_mqtt {
            cfg.mqtt.enabled = false;
        }
        if let Some(filter) = &self.uplink_topic {
            cfg.uplink.enabled = true;
            cfg.uplink.topic = filter.clone();
        }
        if let Some(ms) = self.request_timeout_ms {
            cfg.gateway.request_timeout_ms = ms;
        }
        if let Some(n) = self.queue_capacity {
            cfg.gateway.queue_capacity = n;
        }
        if let Some(level) = &self.log_level {
            cfg.gateway.log_level = level.clone();
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let print_config = cli.print_config;
    let config = cli.into_config()?;

    if print_config {
        print!("{}", config::render_config(&config)?);
        return Ok(());
    }

    // Initialise structured logging.  `RUST_LOG` wins over the config file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.gateway.log_level)),
        )
        .init();

    info!("Modbus gateway starting");

    // ── Core services ─────────────────────────────────────────────────────────
    let registry = Arc::new(DeviceRegistry::new());
    let router = Arc::new(
        RequestRouter::new(Arc::clone(&registry)).with_default_timeout(config.request_timeout()),
    );
    let devices = Arc::new(DeviceManager::new(
        Arc::clone(&registry),
        Arc::new(TcpConnector::default()),
        config.session_config(),
    ));

    for device in &config.devices {
        match devices.connect(device.id, &device.host, device.port).await {
            Ok(_) => info!(device_id = device.id, "configured device connected"),
            Err(e) => warn!(device_id = device.id, "configured device unavailable: {e}"),
        }
    }

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        running_clone.store(false, Ordering::Relaxed);
    });

    // ── Front-ends ────────────────────────────────────────────────────────────
    if config.uplink.enabled && !config.mqtt.enabled {
        warn!("uplink forwarding needs the MQTT bridge; uplinks are ignored");
    }
    let mqtt = config
        .mqtt
        .enabled
        .then(|| MqttBridge::start(&config.mqtt, &config.uplink, Arc::clone(&router)));

    if config.http.enabled {
        let addr = config.http.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP API on {addr}"))?;
        let state = ApiState {
            router: Arc::clone(&router),
            devices: Arc::clone(&devices),
        };
        if let Err(e) = http_api::serve(listener, state, stopped(Arc::clone(&running))).await {
            error!("HTTP API failed: {e}");
        }
    } else {
        stopped(Arc::clone(&running)).await;
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────
    if let Some(bridge) = mqtt {
        bridge.shutdown().await;
    }
    let closed = registry.shutdown_all();
    info!(closed, "Modbus gateway stopped");
    Ok(())
}

/// Resolves once the shutdown flag is cleared.
async fn stopped(running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {e}");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
