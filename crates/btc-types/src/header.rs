//! Block headers.

use crate::{double_sha256, DecodeError, DecodeResult, Sha256Hash, BLOCK_HEADER_SIZE};
use bytes::{Buf, BufMut};

/// Hash of the mainnet genesis block.
pub const GENESIS_BLOCK_HASH: Sha256Hash = Sha256Hash::from_bytes([
    0x00, 0x00, 0x00, 0x00, 0x00, 0x19, 0xd6, 0x68, 0x9c, 0x08, 0x5a, 0xe1, 0x65, 0x83, 0x1e, 0x93,
    0x4f, 0xf7, 0x63, 0xae, 0x46, 0xa2, 0xa6, 0xc1, 0x72, 0xb3, 0xf1, 0xb6, 0x0a, 0x8c, 0xe2, 0x6f,
]);

/// An 80-byte block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version.
    pub version: u32,
    /// Hash of the parent block.
    pub previous_block_hash: Sha256Hash,
    /// Merkle root of the block's transactions.
    pub merkle_root: Sha256Hash,
    /// Seconds since the unix epoch.
    pub timestamp: u32,
    /// Compact difficulty target.
    pub difficulty_bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialize to the 80-byte header format.
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.version);
        buf.put_slice(&self.previous_block_hash.to_le_bytes());
        buf.put_slice(&self.merkle_root.to_le_bytes());
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.difficulty_bits);
        buf.put_u32_le(self.nonce);
        out
    }

    /// Read a header from the front of `buf`, advancing it.
    pub fn read_from(buf: &mut impl Buf) -> DecodeResult<Self> {
        if buf.remaining() < BLOCK_HEADER_SIZE {
            return Err(DecodeError::UnexpectedEnd {
                needed: BLOCK_HEADER_SIZE,
                remaining: buf.remaining(),
            });
        }

        let version = buf.get_u32_le();
        let mut previous = [0u8; 32];
        buf.copy_to_slice(&mut previous);
        let mut merkle = [0u8; 32];
        buf.copy_to_slice(&mut merkle);

        Ok(Self {
            version,
            previous_block_hash: Sha256Hash::from_le_bytes(previous),
            merkle_root: Sha256Hash::from_le_bytes(merkle),
            timestamp: buf.get_u32_le(),
            difficulty_bits: buf.get_u32_le(),
            nonce: buf.get_u32_le(),
        })
    }

    /// Parse a header from exactly 80 bytes.
    pub fn from_bytes(mut data: &[u8]) -> DecodeResult<Self> {
        let header = Self::read_from(&mut data)?;
        if !data.is_empty() {
            return Err(DecodeError::TrailingBytes(data.len()));
        }
        Ok(header)
    }

    /// Block hash.
    pub fn hash(&self) -> Sha256Hash {
        double_sha256(&self.to_bytes())
    }

    /// Whether this header claims to be the first block of a chain.
    pub fn is_genesis(&self) -> bool {
        self.previous_block_hash.is_zero()
    }
}
