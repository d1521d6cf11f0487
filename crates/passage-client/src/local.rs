//! Local service dialer.

use crate::tls;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Errors dialing the local service.
#[derive(Debug, Error)]
pub enum LocalDialError {
    #[error("failed to connect to local service {address}: {source}")]
    Connect {
        address: String,
        source: io::Error,
    },

    #[error("TLS handshake with local service failed: {0}")]
    Tls(io::Error),

    #[error("invalid local server name: {0}")]
    ServerName(io::Error),
}

pub(crate) trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

impl std::fmt::Debug for dyn DuplexStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DuplexStream")
    }
}

/// Boxed duplex stream so the bridge does not care whether the local side
/// is plain TCP or TLS.
pub(crate) type LocalStream = Box<dyn DuplexStream>;

/// Dials the local service, over TCP by default or TLS when configured.
/// Certificate verification is disabled for the TLS case, same as for the
/// remote side.
pub(crate) struct LocalDialer {
    address: String,
    port: u16,
    connector: Option<TlsConnector>,
}

impl LocalDialer {
    pub(crate) fn new(address: &str, port: u16, secure: bool) -> Self {
        Self {
            address: address.to_string(),
            port,
            connector: secure.then(tls::insecure_connector),
        }
    }

    pub(crate) async fn dial(&self) -> Result<LocalStream, LocalDialError> {
        let target = format!("{}:{}", self.address, self.port);
        let stream =
            TcpStream::connect(&target)
                .await
                .map_err(|e| LocalDialError::Connect {
                    address: target.clone(),
                    source: e,
                })?;

        match &self.connector {
            None => {
                tracing::debug!(target = %target, "connected to local service");
                Ok(Box::new(stream))
            }
            Some(connector) => {
                let name = tls::server_name(&self.address).map_err(LocalDialError::ServerName)?;
                let tls_stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(LocalDialError::Tls)?;
                tracing::debug!(target = %target, "connected to local service over TLS");
                Ok(Box::new(tls_stream))
            }
        }
    }
}
