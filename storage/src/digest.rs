//! Content digests.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::{StorageError, StorageErrorKind};

/// Prefix shared by every digest this registry computes.
pub const SHA256_PREFIX: &str = "sha256:";

/// An algorithm-tagged content digest, e.g. `sha256:e3b0c442...`.
///
/// Only sha256 is supported, and the hex part must be exactly 64 lowercase
/// hex characters. This also makes a digest safe to use as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Digest of an in-memory buffer.
    pub fn sha256(data: &[u8]) -> Self {
        Digest(format!("{SHA256_PREFIX}{}", hex::encode(Sha256::digest(data))))
    }

    /// Returns true if `reference` looks like a digest rather than a tag.
    ///
    /// This only checks the algorithm prefix; use [`str::parse`] to validate.
    pub fn is_digest_reference(reference: &str) -> bool {
        reference.starts_with(SHA256_PREFIX)
    }

    /// The full digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The algorithm name, always `sha256`.
    pub fn algorithm(&self) -> &str {
        "sha256"
    }

    /// The hex encoded hash.
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Digest {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StorageError::new(StorageErrorKind::InvalidDigest, format!("{s:?}"));

        let hex = s.strip_prefix(SHA256_PREFIX).ok_or_else(invalid)?;
        if hex.len() != 64
            || !hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid());
        }

        Ok(Digest(s.to_owned()))
    }
}

/// Incremental sha256 over streamed content.
#[derive(Debug, Clone, Default)]
pub(crate) struct Hasher(Sha256);

impl Hasher {
    pub(crate) fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub(crate) fn finish(self) -> Digest {
        Digest(format!("{SHA256_PREFIX}{}", hex::encode(self.0.finalize())))
    }
}
