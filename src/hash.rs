use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Content hash identifying a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileHash(#[serde(with = "hex_32")] pub [u8; 32]);

/// SHA-256 of a single chunk, exchanged for integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkChecksum(#[serde(with = "hex_32")] pub [u8; 32]);

/// Identity of a remote location, as handed out by the routing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 16]);

impl FileHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hashes a whole file on disk.
    pub fn of_file(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }
}

impl ChunkChecksum {
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl PeerId {
    /// Builds an identity whose last byte is `n`. Handy for tests and the loopback demo.
    pub fn from_index(n: u8) -> Self {
        let mut id = [0u8; 16];
        id[15] = n;
        Self(id)
    }
}

/// Key material for the tunnel cipher of one transfer: `SHA-256(hash)`.
pub fn derive_transport_key(hash: &FileHash) -> [u8; 32] {
    Sha256::digest(hash.as_bytes()).into()
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Display for ChunkChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for FileHash {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| TransferError::InvalidHash(e.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransferError::InvalidHash(format!("expected 32 bytes: {s}")))?;
        Ok(Self(array))
    }
}

mod hex_32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
