//! Challenge/response authentication frames for passage tunnel connections.
//!
//! The rendezvous server authenticates every pool connection by sending a
//! challenge frame as the first bytes on the wire; the agent answers with a
//! single response frame carrying its public key and an ECDSA signature over
//! the challenge. Both frames are fixed-size and sent as exactly one write.
//!
//! Wire layout:
//!
//! ```text
//! challenge:  "PSGC" | version (1) | nonce (32)                      = 37 bytes
//! response:   "PSGR" | version (1) | pubkey (33) | signature (64)    = 102 bytes
//! ```
//!
//! The signature is a fixed-size (r,s) secp256k1 ECDSA signature over the
//! full challenge frame, with the message digest computed as SHA-256.
//! Signing is deterministic (RFC 6979), so a given key and challenge always
//! produce the same response bytes.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use thiserror::Error;

/// First bytes of a challenge frame.
pub const CHALLENGE_MAGIC: &[u8; 4] = b"PSGC";

/// First bytes of a response frame.
pub const RESPONSE_MAGIC: &[u8; 4] = b"PSGR";

/// Current protocol version.
pub const VERSION: u8 = 1;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 32;

/// Total length of an encoded challenge frame.
pub const CHALLENGE_LEN: usize = 4 + 1 + NONCE_LEN;

/// Compressed SEC1 public key length.
const PUBKEY_LEN: usize = 33;

/// Fixed-size ECDSA signature length.
const SIGNATURE_LEN: usize = 64;

/// Total length of an encoded response frame.
pub const RESPONSE_LEN: usize = 4 + 1 + PUBKEY_LEN + SIGNATURE_LEN;

/// Errors produced while parsing or verifying handshake frames.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("frame too short or too long: got {got} bytes, expected {expected}")]
    InvalidLength { got: usize, expected: usize },

    #[error("frame does not start with the expected magic")]
    BadMagic,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("response carries an invalid public key")]
    InvalidPublicKey,

    #[error("response carries a malformed signature")]
    MalformedSignature,

    #[error("signature does not verify against the challenge")]
    SignatureMismatch,
}

/// A server-issued challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    nonce: [u8; NONCE_LEN],
}

impl Challenge {
    /// Generate a challenge with a random nonce. Used by the server side
    /// and by test fakes.
    pub fn generate() -> Self {
        Self {
            nonce: rand::random(),
        }
    }

    /// Build a challenge from a fixed nonce.
    pub fn from_nonce(nonce: [u8; NONCE_LEN]) -> Self {
        Self { nonce }
    }

    /// Parse a challenge frame received from the wire.
    pub fn parse(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() != CHALLENGE_LEN {
            return Err(HandshakeError::InvalidLength {
                got: bytes.len(),
                expected: CHALLENGE_LEN,
            });
        }
        if &bytes[..4] != CHALLENGE_MAGIC {
            return Err(HandshakeError::BadMagic);
        }
        if bytes[4] != VERSION {
            return Err(HandshakeError::UnsupportedVersion(bytes[4]));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[5..]);
        Ok(Self { nonce })
    }

    /// Encode the challenge as a wire frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHALLENGE_LEN);
        out.extend_from_slice(CHALLENGE_MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&self.nonce);
        out
    }

    /// The challenge nonce.
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Sign the challenge with the given key, producing the complete
    /// response frame to write back to the server.
    pub fn sign(&self, key: &SigningKey) -> Vec<u8> {
        let signature: Signature = key.sign(&self.to_bytes());
        let public_key = key.verifying_key().to_encoded_point(true);

        let mut out = Vec::with_capacity(RESPONSE_LEN);
        out.extend_from_slice(RESPONSE_MAGIC);
        out.push(VERSION);
        out.extend_from_slice(public_key.as_bytes());
        out.extend_from_slice(&signature.to_bytes());
        out
    }
}

/// A parsed client response. Used by the server side and by test fakes;
/// the agent itself only ever produces response bytes.
#[derive(Debug, Clone)]
pub struct Response {
    public_key: VerifyingKey,
    signature: Signature,
}

impl Response {
    /// Parse a response frame received from the wire.
    pub fn parse(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() != RESPONSE_LEN {
            return Err(HandshakeError::InvalidLength {
                got: bytes.len(),
                expected: RESPONSE_LEN,
            });
        }
        if &bytes[..4] != RESPONSE_MAGIC {
            return Err(HandshakeError::BadMagic);
        }
        if bytes[4] != VERSION {
            return Err(HandshakeError::UnsupportedVersion(bytes[4]));
        }
        let public_key = VerifyingKey::from_sec1_bytes(&bytes[5..5 + PUBKEY_LEN])
            .map_err(|_| HandshakeError::InvalidPublicKey)?;
        let signature = Signature::from_slice(&bytes[5 + PUBKEY_LEN..])
            .map_err(|_| HandshakeError::MalformedSignature)?;
        Ok(Self {
            public_key,
            signature,
        })
    }

    /// Verify the signature against the challenge it answers.
    pub fn verify(&self, challenge: &Challenge) -> Result<(), HandshakeError> {
        self.public_key
            .verify(&challenge.to_bytes(), &self.signature)
            .map_err(|_| HandshakeError::SignatureMismatch)
    }

    /// The public key the client authenticated with.
    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }
}
