//! Tunnel identity derivation.
//!
//! The tunnel identity is a pure function of the private key:
//! `RIPEMD160(SHA256(compressed secp256k1 public key))`, rendered as 40
//! lowercase hex characters. It is stable for the lifetime of the tunnel
//! and doubles as the subdomain the rendezvous server routes user traffic
//! by.

use crate::config::ConfigError;
use k256::ecdsa::SigningKey;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Derived tunnel identity. Deterministic; no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelIdentity {
    id: String,
    remote_address: String,
}

impl TunnelIdentity {
    /// Derive the identity from a raw private key. Fails only on a key
    /// that is not a valid secp256k1 scalar.
    pub fn derive(private_key: &[u8; 32], remote_address: &str) -> Result<Self, ConfigError> {
        let key = SigningKey::from_bytes(&(*private_key).into())
            .map_err(|_| ConfigError::InvalidPrivateKey)?;
        let public_key = key.verifying_key().to_encoded_point(true);

        let sha = Sha256::digest(public_key.as_bytes());
        let digest = Ripemd160::digest(sha);

        Ok(Self {
            id: hex::encode(digest),
            remote_address: remote_address.to_string(),
        })
    }

    /// The 40-hex-character tunnel id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Public URL user traffic for this tunnel arrives at.
    pub fn url(&self) -> String {
        format!("https://{}.{}", self.id, self.remote_address)
    }

    /// Public URL for a caller-supplied alias.
    pub fn alias_url(&self, alias: &str) -> String {
        format!("https://{}.{}", alias, self.remote_address)
    }
}
