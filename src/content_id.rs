//! Self-describing content identifiers for track bytes.
//!
//! An identifier is derived from the full byte content with SHA-256 and
//! carries the algorithm name, so identical bytes always map to the same
//! identifier regardless of which client produced it.

use sha2::{Digest, Sha256};

const ALGORITHM_PREFIX: &str = "sha256:";

/// Identifier of a distinct byte sequence, e.g. `sha256:9f86d0…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Computes the identifier of `bytes` in one pass.
    pub fn from_bytes(bytes: &[u8]) -> ContentId {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ContentId::from_digest(hasher)
    }

    /// Finishes a streaming digest started with [`ContentId::hasher`].
    pub fn from_digest(hasher: Sha256) -> ContentId {
        ContentId(format!("{}{:x}", ALGORITHM_PREFIX, hasher.finalize()))
    }

    /// Fresh hasher for chunked digesting on the upload worker.
    pub fn hasher() -> Sha256 {
        Sha256::new()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ContentId {
    fn from(value: String) -> Self {
        ContentId(value)
    }
}

impl From<&str> for ContentId {
    fn from(value: &str) -> Self {
        ContentId(value.to_string())
    }
}
