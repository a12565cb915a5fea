//! Content fingerprints
//!
//! A fingerprint is the lowercase hex SHA-256 of a byte sequence. Files and
//! in-memory build output are hashed the same way, so a manifest on disk and
//! the identical bytes produced by `kustomize build` compare equal.

use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Hex-encoded SHA-256 digest of some content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of an in-memory buffer
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(bytes.as_ref());
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// Fingerprint of a file's contents
    pub async fn of_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::io(path, e))?;
        Ok(Self::of(bytes))
    }

    /// Wrap a digest read back from a store
    pub fn from_stored(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
