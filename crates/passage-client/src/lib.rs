//! Passage client - reverse tunnel agent for exposing a local service
//! through a rendezvous server.
//!
//! The agent keeps a pool of outbound, authenticated TLS connections open
//! to the rendezvous server. When the server receives user traffic for
//! this tunnel's identity it forwards the bytes down one of the pooled
//! connections; the agent bridges them to a freshly dialed local
//! connection and pipes responses back.
//!
//! # Example Usage
//!
//! ```no_run
//! use passage_client::{Tunnel, TunnelConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TunnelConfig::builder()
//!         .local_address("localhost")
//!         .local_port(3000)
//!         .remote_address("passage.example.com")
//!         .remote_port(443)
//!         .build()?;
//!
//!     let tunnel = Tunnel::new(config)?;
//!     println!("serving at {}", tunnel.url());
//!     tunnel.open(None).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     tunnel.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! 1. **Identity**: the tunnel id is derived from the secp256k1 private
//!    key (`RIPEMD160(SHA256(pubkey))`) and doubles as the public
//!    subdomain.
//! 2. **Handshake**: every pool connection answers the server's challenge
//!    with a signed response (see `passage-handshake`).
//! 3. **Pairing**: each authenticated connection is bridged 1:1 to a
//!    fresh local connection, with an optional one-shot `Host:` header
//!    rewrite on the forward path.
//! 4. **Supervision**: connection loss triggers replacement dials; an
//!    emptied pool schedules a timed reconnect; a heartbeat refreshes the
//!    whole pool periodically.

mod bridge;
pub mod config;
pub mod identity;
mod local;
mod pool;
pub mod remote;
pub mod rewrite;
pub mod status;
mod tls;
pub mod tunnel;

// Re-export public API
pub use config::{ConfigError, Transform, TunnelConfig, TunnelConfigBuilder};
pub use identity::TunnelIdentity;
pub use local::LocalDialError;
pub use remote::RemoteDialError;
pub use rewrite::HostHeaderRewriter;
pub use status::{StatusError, StatusRequest};
pub use tunnel::{Tunnel, TunnelError, TunnelEvent};
