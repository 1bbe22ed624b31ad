//! CSMS Node - OCPP 1.6-J central system
//!
//! Accepts charge point WebSocket connections and serves the operator
//! control API.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (ws :9000, http :8000)
//! csms-node
//!
//! # Load a config file, override the command timeout
//! csms-node --config csms.json --call-timeout-ms 2000
//!
//! # Never fabricate results for silent charge points
//! csms-node --no-fallback --log-level debug
//! ```
//!
//! # Demo Scenario
//!
//! 1. A charge point connects to `ws://localhost:9000/ws/ocpp/CP-1/`
//! 2. `curl localhost:8000/chargers` lists `CP-1`
//! 3. `curl -X POST localhost:8000/stop/CP-1 -d '{"transaction_id": 12345}'`
//!    sends RemoteStopTransaction and reports the charge point's answer

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use csms_server::{CentralSystem, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP 1.6-J central system node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Charge point WebSocket listen address
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Control API listen address
    #[arg(long)]
    http_bind: Option<SocketAddr>,

    /// How long operator commands wait for the charge point (ms)
    #[arg(long)]
    call_timeout_ms: Option<u64>,

    /// Report timeouts instead of assuming success
    #[arg(long)]
    no_fallback: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Build configuration
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = args.ws_bind {
        config = config.with_ws_bind(addr);
    }
    if let Some(addr) = args.http_bind {
        config = config.with_http_bind(addr);
    }
    if let Some(ms) = args.call_timeout_ms {
        config = config.with_call_timeout(Duration::from_millis(ms));
    }
    if args.no_fallback {
        config = config.without_fallback();
    }

    let fallback = config.fallback_policy();
    let fallback_actions = if fallback.is_enabled() {
        fallback.actions().join(", ")
    } else {
        "disabled".to_string()
    };

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              CSMS Node - OCPP 1.6-J Central System           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Charge points: {:<45} ║", format!("ws://{}{}<id>/", config.ws_bind, config.normalized_path_prefix()));
    println!("║  Control API:   {:<45} ║", format!("http://{}", config.http_bind));
    println!("║  Call timeout:  {:<45} ║", format!("{:?}", config.call_timeout));
    println!("║  Fallback:      {:<45} ║", truncate(&fallback_actions, 45));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let system = CentralSystem::new(config).bind().await?;
    let shutdown = system.shutdown_token();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shutdown.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    info!("Starting central system...");
    system.run().await?;

    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
