//! Cell hash type using SHA-256

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 hash identifying a cell at some level
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellHash([u8; 32]);

impl CellHash {
    /// The zero hash
    pub const ZERO: CellHash = CellHash([0u8; 32]);

    /// Create a hash from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        CellHash(bytes)
    }

    /// Create a hash from a 32-byte slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(CellHash(arr))
    }

    /// Hash arbitrary data
    pub fn digest(data: &[u8]) -> Self {
        CellHash(Sha256::digest(data).into())
    }

    /// Hash multiple pieces of data
    pub fn digest_many(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        CellHash(hasher.finalize().into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(CellHash(arr))
    }

    /// Get a short prefix for display
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    /// Check if this is the zero hash
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for CellHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for CellHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellHash({})", self.short())
    }
}

impl Default for CellHash {
    fn default() -> Self {
        CellHash::ZERO
    }
}

impl AsRef<[u8]> for CellHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_digest() {
        let h1 = CellHash::digest(b"hello");
        let h2 = CellHash::digest(b"hello");
        let h3 = CellHash::digest(b"world");

        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_digest_many_matches_concat() {
        assert_eq!(
            CellHash::digest_many(&[b"ab", b"cd"]),
            CellHash::digest(b"abcd")
        );
    }

    #[test]
    fn test_known_sha256() {
        assert_eq!(
            CellHash::digest(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let h1 = CellHash::digest(b"test data");
        let h2 = CellHash::from_hex(&h1.to_hex()).unwrap();
        assert_eq!(h1, h2);
        assert!(CellHash::from_hex("abcd").is_err());
    }
}
