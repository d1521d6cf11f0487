//! Bidirectional bridging between one remote and one local connection.
//!
//! The forward path runs remote → host-header rewriter → user transform →
//! local; the reverse path copies local → remote untouched. The bridge
//! ends as soon as either side closes or errors, or when the supervisor
//! tears it down during `close()`, and reports which of those happened so
//! the supervisor can pick the right reconnection path.

use crate::config::Transform;
use crate::rewrite::HostHeaderRewriter;
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const BUFFER_SIZE: usize = 8192;

/// Why a bridge ended.
#[derive(Debug)]
pub(crate) enum BridgeOutcome {
    /// The remote side closed (error set when it failed rather than EOF'd).
    RemoteClosed { error: Option<io::Error> },
    /// The local side closed or failed first.
    LocalClosed { error: Option<io::Error> },
    /// Torn down by `close()`.
    Shutdown,
}

enum ForwardEnd {
    RemoteEof,
    RemoteError(io::Error),
    LocalError(io::Error),
}

enum ReverseEnd {
    LocalEof,
    LocalError(io::Error),
    RemoteError(io::Error),
}

/// Pipe bytes both ways until either side ends or shutdown is signalled.
pub(crate) async fn run<R, L>(
    remote: R,
    local: L,
    rewriter: Option<HostHeaderRewriter>,
    transform: Option<Transform>,
    shutdown: &mut mpsc::Receiver<()>,
) -> BridgeOutcome
where
    R: AsyncRead + AsyncWrite + Unpin + Send,
    L: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let (mut local_read, mut local_write) = tokio::io::split(local);

    let forward = async {
        let mut rewriter = rewriter;
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            match remote_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = local_write.shutdown().await;
                    tracing::debug!(bytes_to_local = total, "remote closed");
                    return ForwardEnd::RemoteEof;
                }
                Ok(n) => {
                    let mut chunk = Bytes::copy_from_slice(&buf[..n]);
                    if let Some(r) = rewriter.as_mut() {
                        chunk = r.apply(chunk);
                    }
                    if let Some(t) = &transform {
                        chunk = t(chunk);
                    }
                    if let Err(e) = local_write.write_all(&chunk).await {
                        return ForwardEnd::LocalError(e);
                    }
                    total += chunk.len() as u64;
                }
                Err(e) => return ForwardEnd::RemoteError(e),
            }
        }
    };

    let reverse = async {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            match local_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = remote_write.shutdown().await;
                    tracing::debug!(bytes_to_remote = total, "local closed");
                    return ReverseEnd::LocalEof;
                }
                Ok(n) => {
                    if let Err(e) = remote_write.write_all(&buf[..n]).await {
                        return ReverseEnd::RemoteError(e);
                    }
                    total += n as u64;
                }
                Err(e) => return ReverseEnd::LocalError(e),
            }
        }
    };

    tokio::select! {
        end = forward => match end {
            ForwardEnd::RemoteEof => BridgeOutcome::RemoteClosed { error: None },
            ForwardEnd::RemoteError(e) => BridgeOutcome::RemoteClosed { error: Some(e) },
            ForwardEnd::LocalError(e) => BridgeOutcome::LocalClosed { error: Some(e) },
        },
        end = reverse => match end {
            ReverseEnd::LocalEof => BridgeOutcome::LocalClosed { error: None },
            ReverseEnd::LocalError(e) => BridgeOutcome::LocalClosed { error: Some(e) },
            ReverseEnd::RemoteError(e) => BridgeOutcome::RemoteClosed { error: Some(e) },
        },
        _ = shutdown.recv() => BridgeOutcome::Shutdown,
    }
}
