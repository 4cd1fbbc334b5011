//! Identifiers and credentials: 20-byte hashes for peers and senders, password credential.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Size in bytes of every identifier on the wire.
pub const HASH_SIZE: usize = 20;

/// Fixed-width identifier (peer ID, sender ID, shared directory ID).
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Hash([u8; HASH_SIZE]);

/// Peers are identified by a `Hash`.
pub type PeerId = Hash;

impl Hash {
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Random identifier from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; HASH_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Hash(bytes)
    }

    /// All-zero hash, used as "no sender known yet".
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl FromStr for Hash {
    type Err = hex::FromHexError;

    /// Parse the 40-digit hex form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; HASH_SIZE];
        hex::decode_to_slice(s.trim(), &mut bytes)?;
        Ok(Hash(bytes))
    }
}

/// Password credential sent to a remote core. Never printed.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credential([u8; HASH_SIZE]);

impl Credential {
    /// Derive the credential from a clear-text password.
    pub fn from_password(password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"dlan-password-v1");
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&digest[..HASH_SIZE]);
        Credential(out)
    }

    /// Empty credential (local cores need none).
    pub fn none() -> Self {
        Credential([0u8; HASH_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}
