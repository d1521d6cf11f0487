//! One-shot HTTP `Host:` header rewrite.
//!
//! When the tunnel targets an arbitrary internal host, virtual-host routing
//! on the local server needs the `Host:` header to name that host; when it
//! targets loopback the original header is already valid. The rewrite is
//! therefore applied only when the local address is not `localhost`, and it
//! fires at most once per bridge.
//!
//! The match operates on a single chunk: a `Host:` header split across TCP
//! reads is passed through unmodified. That mirrors the wire behavior this
//! protocol has always had.

use bytes::Bytes;
use regex::bytes::Regex;

const HOST_PREFIX: &[u8] = b"\r\nHost: ";

/// Stateful stream stage replacing the first `Host:` header value.
pub struct HostHeaderRewriter {
    pattern: Regex,
    replacement: Vec<u8>,
    replaced: bool,
}

impl HostHeaderRewriter {
    pub fn new(local_address: &str) -> Self {
        Self {
            pattern: Regex::new(r"\r\nHost: \S+").expect("static pattern"),
            replacement: local_address.as_bytes().to_vec(),
            replaced: false,
        }
    }

    /// Whether the rewrite stage should be in the pipeline at all.
    pub fn applies_to(local_address: &str) -> bool {
        local_address != "localhost"
    }

    /// Process one chunk. After the first successful replacement every
    /// later chunk passes through untouched.
    pub fn apply(&mut self, chunk: Bytes) -> Bytes {
        if self.replaced {
            return chunk;
        }
        let Some(found) = self.pattern.find(&chunk) else {
            return chunk;
        };

        let mut out = Vec::with_capacity(chunk.len() + self.replacement.len());
        out.extend_from_slice(&chunk[..found.start() + HOST_PREFIX.len()]);
        out.extend_from_slice(&self.replacement);
        out.extend_from_slice(&chunk[found.end()..]);
        self.replaced = true;
        Bytes::from(out)
    }
}
