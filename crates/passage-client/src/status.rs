//! Status endpoint client.
//!
//! One-shot `GET https://<remote>/<tunnel-id>` returning the parsed JSON
//! body. This is a deliberately minimal HTTP/1.1 client over the same
//! verification-disabled TLS the rest of the agent uses; a full HTTP stack
//! would be overkill for a single status probe.

use crate::tls;
use serde_json::Value;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Errors querying the status endpoint. Returned to the caller; never
/// affect tunnel state.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to connect to status endpoint {address}: {source}")]
    Connect {
        address: String,
        source: io::Error,
    },

    #[error("TLS handshake with status endpoint failed: {0}")]
    Tls(io::Error),

    #[error("invalid status server name: {0}")]
    ServerName(io::Error),

    #[error("status request failed: {0}")]
    Io(io::Error),

    #[error("malformed status response: {0}")]
    MalformedResponse(String),

    #[error("status endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },

    #[error("failed to parse status body: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Caller overrides merged over the default request.
#[derive(Debug, Clone, Default)]
pub struct StatusRequest {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub headers: Vec<(String, String)>,
}

pub(crate) struct StatusClient {
    remote_address: String,
    tunnel_id: String,
    connector: TlsConnector,
}

impl StatusClient {
    pub(crate) fn new(remote_address: &str, tunnel_id: &str) -> Self {
        Self {
            remote_address: remote_address.to_string(),
            tunnel_id: tunnel_id.to_string(),
            connector: tls::insecure_connector(),
        }
    }

    pub(crate) async fn query(
        &self,
        overrides: Option<StatusRequest>,
    ) -> Result<Value, StatusError> {
        let overrides = overrides.unwrap_or_default();
        let host = overrides
            .hostname
            .unwrap_or_else(|| self.remote_address.clone());
        let port = overrides.port.unwrap_or(443);
        let path = overrides
            .path
            .unwrap_or_else(|| format!("/{}", self.tunnel_id));

        let address = format!("{}:{}", host, port);
        let tcp = TcpStream::connect(&address)
            .await
            .map_err(|e| StatusError::Connect {
                address: address.clone(),
                source: e,
            })?;

        let name = tls::server_name(&host).map_err(StatusError::ServerName)?;
        let stream = self
            .connector
            .connect(name, tcp)
            .await
            .map_err(StatusError::Tls)?;

        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: application/json\r\nConnection: close\r\n",
            path, host
        );
        for (header, value) in &overrides.headers {
            request.push_str(&format!("{}: {}\r\n", header, value));
        }
        request.push_str("\r\n");

        let (read_half, mut write_half) = tokio::io::split(stream);
        write_half
            .write_all(request.as_bytes())
            .await
            .map_err(StatusError::Io)?;

        let mut reader = BufReader::new(read_half);

        let mut status_line = String::new();
        reader
            .read_line(&mut status_line)
            .await
            .map_err(StatusError::Io)?;
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| StatusError::MalformedResponse(status_line.trim().to_string()))?;

        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.map_err(StatusError::Io)?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
            if let Some((header, value)) = line.split_once(':') {
                if header.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok();
                }
            }
        }

        let body = match content_length {
            Some(len) => {
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf).await.map_err(StatusError::Io)?;
                buf
            }
            None => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await.map_err(StatusError::Io)?;
                buf
            }
        };

        if status == 200 {
            return Ok(serde_json::from_slice(&body)?);
        }

        let parsed: Value = serde_json::from_slice(&body)?;
        let message = parsed
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status_line.trim().to_string());
        Err(StatusError::Endpoint { status, message })
    }
}
