//! Passage - expose a local service through a passage rendezvous server.
//!
//! # Example Usage
//!
//! ```bash
//! # Expose localhost:3000 through the default rendezvous port
//! passage --remote-address passage.example.com --local-port 3000
//!
//! # Expose an internal host with a stable identity
//! passage \
//!   --remote-address passage.example.com \
//!   --local-address 192.168.1.20 --local-port 8080 \
//!   --key 0101010101010101010101010101010101010101010101010101010101010101
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use passage_client::{config, Tunnel, TunnelConfig};
use std::time::Duration;
use tracing::{error, info, warn};

/// Reverse tunnel agent: exposes a local TCP/TLS service through a pool of
/// authenticated TLS connections to a passage rendezvous server.
#[derive(Parser, Debug)]
#[command(name = "passage", version, about)]
struct Args {
    /// Hostname or IP of the local service to expose
    #[arg(long, env = "PASSAGE_LOCAL_ADDRESS", default_value = "localhost")]
    local_address: String,

    /// Port of the local service
    #[arg(long, env = "PASSAGE_LOCAL_PORT")]
    local_port: u16,

    /// Hostname of the rendezvous server
    #[arg(long, env = "PASSAGE_REMOTE_ADDRESS")]
    remote_address: String,

    /// Tunnel port on the rendezvous server
    #[arg(long, env = "PASSAGE_REMOTE_PORT", default_value_t = 443)]
    remote_port: u16,

    /// Number of pooled tunnel connections to keep open
    #[arg(long, default_value_t = config::DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Hex-encoded 32-byte private key (random if omitted)
    ///
    /// The key defines the tunnel identity and therefore the public URL;
    /// pass the same key to keep a stable URL across restarts.
    #[arg(long, env = "PASSAGE_KEY")]
    key: Option<String>,

    /// Dial the local service over TLS instead of plain TCP
    #[arg(long)]
    secure_local: bool,

    /// Disable reconnection after the pool empties on errors
    #[arg(long)]
    no_reconnect: bool,

    /// Heartbeat / reconnect interval in milliseconds
    #[arg(long, default_value_t = 30_000)]
    reconnect_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .with_target(true)
        .init();

    let mut builder = TunnelConfig::builder()
        .local_address(args.local_address)
        .local_port(args.local_port)
        .remote_address(args.remote_address)
        .remote_port(args.remote_port)
        .max_connections(args.max_connections)
        .secure_local_connection(args.secure_local)
        .auto_reconnect(!args.no_reconnect)
        .auto_reconnect_interval(Duration::from_millis(args.reconnect_interval_ms));

    if let Some(encoded) = &args.key {
        builder = builder.private_key(parse_key(encoded)?);
    }

    let config = builder.build().context("invalid configuration")?;
    let tunnel = Tunnel::new(config).context("failed to create tunnel")?;

    info!("tunnel id: {}", tunnel.id());
    info!("public url: {}", tunnel.url());
    warn!("certificate verification to the rendezvous server is disabled by protocol");

    tokio::select! {
        result = tunnel.open(None) => {
            if let Err(e) = result {
                error!("failed to open tunnel: {}", e);
                return Err(e.into());
            }
            info!("tunnel established");
            tokio::signal::ctrl_c().await?;
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    info!("shutting down");
    tunnel.close().await;
    Ok(())
}

fn parse_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(encoded).context("key is not valid hex")?;
    let Ok(key) = <[u8; 32]>::try_from(bytes) else {
        bail!("key must be exactly 32 bytes (64 hex characters)");
    };
    Ok(key)
}
