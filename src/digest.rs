//! Binary change detection.
//!
//! Upgrades are detected by comparing 64-bit XXH64 digests of binary
//! content, rendered as lowercase hex. The digest is not a security
//! boundary; authenticating the update source is the fetcher's job.

use xxhash_rust::xxh64::Xxh64;

/// Streaming XXH64 state.
pub struct Digest {
    inner: Xxh64,
}

impl Digest {
    /// Creates an empty digest (seed 0, matching the reference tooling).
    pub fn new() -> Self {
        Self { inner: Xxh64::new(0) }
    }

    /// Feeds a chunk of bytes into the digest.
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Finalizes into a lowercase hex string.
    pub fn hex(&self) -> String {
        format!("{:x}", self.inner.digest())
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot digest of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut digest = Digest::new();
    digest.update(data);
    digest.hex()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_matches_known_vector() {
        assert_eq!(hash_bytes(b""), "ef46db3751d8e999");
    }

    #[test]
    fn chunked_updates_match_one_shot() {
        let mut digest = Digest::new();
        digest.update(b"hello ");
        digest.update(b"world");
        assert_eq!(digest.hex(), hash_bytes(b"hello world"));
    }

    #[test]
    fn different_content_hashes_differently() {
        assert_ne!(hash_bytes(b"version-a"), hash_bytes(b"version-b"));
    }
}
