//! SHA-256 hashes.

use crate::{DecodeError, DecodeResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A 32-byte hash stored in display (big-endian) order.
///
/// Block and transaction hashes are computed over little-endian data and
/// shown reversed, so the bytes kept here match what explorers print.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Sha256Hash([u8; 32]);

impl Sha256Hash {
    /// The all-zero hash (previous hash of the genesis block).
    pub const ZERO: Sha256Hash = Sha256Hash([0u8; 32]);

    /// Wrap bytes that are already in display order.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Wrap bytes in little-endian (wire) order.
    pub fn from_le_bytes(mut bytes: [u8; 32]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    /// Parse from a byte slice in display order.
    pub fn from_slice(bytes: &[u8]) -> DecodeResult<Self> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DecodeError::InvalidHashLength(bytes.len()))?;
        Ok(Self(array))
    }

    /// Bytes in display order.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Bytes in little-endian (wire) order.
    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// Whether every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

/// Hash `data` twice with SHA-256 and return the digest in display order.
pub fn double_sha256(data: &[u8]) -> Sha256Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&second);
    Sha256Hash::from_le_bytes(bytes)
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Hash({})", hex::encode(self.0))
    }
}

impl FromStr for Sha256Hash {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Sha256Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Sha256Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let text = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash: Sha256Hash = text.parse().unwrap();
        assert_eq!(hash.to_string(), text);
        assert_eq!(hash.as_bytes()[0], 0x00);
        assert_eq!(hash.to_le_bytes()[0], 0x6f);
    }

    #[test]
    fn test_invalid_length() {
        let result: Result<Sha256Hash, _> = "abcd".parse();
        assert_eq!(result, Err(DecodeError::InvalidHashLength(2)));
    }

    #[test]
    fn test_double_sha256_empty() {
        // sha256(sha256("")) = 5df6e0e2...9456, shown reversed
        let hash = double_sha256(b"");
        assert_eq!(
            hash.to_string(),
            "56944c5d3f98413ef45cf54545538103cc9f298e0575820ad3591376e2e0f65d"
        );
    }

    #[test]
    fn test_zero() {
        assert!(Sha256Hash::ZERO.is_zero());
        assert!(!double_sha256(b"x").is_zero());
    }
}
