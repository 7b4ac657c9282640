//! Payload digests

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

/// Incremental BLAKE3 digest of a payload as it is streamed
pub struct PayloadDigest {
    hasher: blake3::Hasher,
    bytes: u64,
}

impl Default for PayloadDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadDigest {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Lowercase hex digest
    pub fn finish(&self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

/// Hex BLAKE3 digest of a file on disk
pub fn hash_file_blake3(path: &Path) -> Result<String> {
    let mut f = std::fs::File::open(path)
        .with_context(|| format!("open {} for hashing", path.display()))?;
    let mut digest = PayloadDigest::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finish())
}
