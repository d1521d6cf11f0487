//! Remote rendezvous dialer and per-connection authentication.
//!
//! Dialing happens in two phases so the supervisor can register the
//! connection with the pool as soon as the transport is up, before the
//! challenge exchange: `RemoteDialer::connect` yields a `PendingRemote`,
//! and `PendingRemote::authenticate` performs the challenge/sign/response
//! round. The response is written as exactly one frame and the dial
//! resolves without waiting for a server ack.

use crate::tls;
use k256::ecdsa::SigningKey;
use passage_handshake::{Challenge, HandshakeError};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Errors opening or authenticating a pool connection.
#[derive(Debug, Error)]
pub enum RemoteDialError {
    #[error("failed to connect to remote {address}: {source}")]
    Connect {
        address: String,
        source: io::Error,
    },

    #[error("TLS handshake with remote failed: {0}")]
    Tls(io::Error),

    #[error("invalid remote server name: {0}")]
    ServerName(io::Error),

    #[error("failed to read challenge: {0}")]
    ChallengeRead(io::Error),

    #[error("remote closed the connection before sending a challenge")]
    ClosedBeforeChallenge,

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("failed to write handshake response: {0}")]
    ResponseWrite(io::Error),
}

impl RemoteDialError {
    /// True when the underlying failure was a refused TCP connection.
    pub fn is_connection_refused(&self) -> bool {
        matches!(
            self,
            Self::Connect { source, .. } if source.kind() == io::ErrorKind::ConnectionRefused
        )
    }
}

/// An authenticated pool connection transport.
pub(crate) type RemoteStream = TlsStream<TcpStream>;

pub(crate) struct RemoteDialer {
    address: String,
    port: u16,
    connector: TlsConnector,
}

impl RemoteDialer {
    pub(crate) fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            connector: tls::insecure_connector(),
        }
    }

    /// Open the TLS transport. The connection is not authenticated yet.
    pub(crate) async fn connect(&self) -> Result<PendingRemote, RemoteDialError> {
        let target = format!("{}:{}", self.address, self.port);
        let tcp = TcpStream::connect(&target)
            .await
            .map_err(|e| RemoteDialError::Connect {
                address: target.clone(),
                source: e,
            })?;

        let name = tls::server_name(&self.address).map_err(RemoteDialError::ServerName)?;
        let stream = self
            .connector
            .connect(name, tcp)
            .await
            .map_err(RemoteDialError::Tls)?;

        tracing::debug!(remote = %target, "tunnel transport connected");
        Ok(PendingRemote { stream })
    }
}

/// A connected but not yet authenticated remote connection.
#[derive(Debug)]
pub(crate) struct PendingRemote {
    stream: RemoteStream,
}

impl PendingRemote {
    /// Wait for the challenge, sign it, write the response. The first
    /// inbound chunk is taken as the whole challenge blob; the remote is
    /// defined to send it as one write, so there is no reassembly.
    pub(crate) async fn authenticate(
        mut self,
        key: &SigningKey,
    ) -> Result<RemoteStream, RemoteDialError> {
        let mut buf = [0u8; 256];
        let n = self
            .stream
            .read(&mut buf)
            .await
            .map_err(RemoteDialError::ChallengeRead)?;
        if n == 0 {
            return Err(RemoteDialError::ClosedBeforeChallenge);
        }

        let challenge = Challenge::parse(&buf[..n])?;
        let response = challenge.sign(key);

        self.stream
            .write_all(&response)
            .await
            .map_err(RemoteDialError::ResponseWrite)?;
        self.stream
            .flush()
            .await
            .map_err(RemoteDialError::ResponseWrite)?;

        tracing::debug!("pool connection authenticated");
        Ok(self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connect_is_detected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = RemoteDialer::new("127.0.0.1", port);
        let err = dialer.connect().await.unwrap_err();
        assert!(err.is_connection_refused());
    }

    #[test]
    fn test_non_connect_errors_are_not_refused() {
        let err = RemoteDialError::ClosedBeforeChallenge;
        assert!(!err.is_connection_refused());
    }
}
