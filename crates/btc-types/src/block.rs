//! Blocks and the pending-block payload codec.

use crate::{
    double_sha256, BlockHeader, DecodeError, DecodeResult, Sha256Hash, Transaction,
    BLOCK_HEADER_SIZE, MAX_BLOCK_SIZE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A full block: header plus ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Transactions in block order (coinbase first).
    pub transactions: Vec<Transaction>,
}

/// A header announced together with its block's transaction count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeaderWithTransactionCount {
    /// The header.
    pub header: BlockHeader,
    /// Number of transactions in the block.
    pub transaction_count: usize,
}

impl Block {
    /// Create a block.
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Block hash (the header hash).
    pub fn hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    /// Hash of the parent block.
    pub fn previous_block_hash(&self) -> Sha256Hash {
        self.header.previous_block_hash
    }

    /// Number of transactions.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Transaction hashes in block order.
    pub fn transaction_hashes(&self) -> Vec<Sha256Hash> {
        self.transactions.iter().map(|tx| tx.hash()).collect()
    }

    /// Compute the merkle root over the transaction hashes.
    ///
    /// Pairs are hashed in little-endian order; an odd trailing hash is
    /// paired with itself.
    pub fn calculate_merkle_root(&self) -> Sha256Hash {
        merkle_root(&self.transaction_hashes())
    }

    /// Whether the header commits to exactly these transactions.
    pub fn has_valid_merkle_root(&self) -> bool {
        !self.transactions.is_empty() && self.calculate_merkle_root() == self.header.merkle_root
    }

    /// Header together with the transaction count.
    pub fn header_with_transaction_count(&self) -> BlockHeaderWithTransactionCount {
        BlockHeaderWithTransactionCount {
            header: self.header.clone(),
            transaction_count: self.transactions.len(),
        }
    }

    /// Encode as a pending-block payload.
    pub fn to_bytes(&self) -> Bytes {
        let body: usize = self.transactions.iter().map(|tx| tx.len() + 9).sum();
        let mut buf = BytesMut::with_capacity(BLOCK_HEADER_SIZE + 9 + body);
        buf.put_slice(&self.header.to_bytes());
        put_compact_size(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            put_compact_size(&mut buf, tx.len() as u64);
            buf.put_slice(tx.bytes());
        }
        buf.freeze()
    }

    /// Decode a pending-block payload.
    pub fn from_bytes(data: &[u8]) -> DecodeResult<Self> {
        if data.len() > MAX_BLOCK_SIZE {
            return Err(DecodeError::TooLarge {
                size: data.len(),
                max: MAX_BLOCK_SIZE,
            });
        }

        let mut buf = Bytes::copy_from_slice(data);
        let header = BlockHeader::read_from(&mut buf)?;

        let count = read_compact_size(&mut buf)? as usize;
        // Every transaction needs at least its one-byte length prefix.
        if count > buf.remaining() {
            return Err(DecodeError::UnexpectedEnd {
                needed: count,
                remaining: buf.remaining(),
            });
        }

        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_compact_size(&mut buf)? as usize;
            if len > buf.remaining() {
                return Err(DecodeError::UnexpectedEnd {
                    needed: len,
                    remaining: buf.remaining(),
                });
            }
            transactions.push(Transaction::from_bytes(buf.split_to(len)));
        }

        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }

        Ok(Self::new(header, transactions))
    }
}

/// Merkle root of an ordered list of transaction hashes.
pub(crate) fn merkle_root(hashes: &[Sha256Hash]) -> Sha256Hash {
    if hashes.is_empty() {
        return Sha256Hash::ZERO;
    }

    let mut level: Vec<[u8; 32]> = hashes.iter().map(|h| h.to_le_bytes()).collect();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(&last) = level.last() {
                level.push(last);
            }
        }

        level = level
            .chunks(2)
            .map(|pair| {
                let mut joined = [0u8; 64];
                joined[..32].copy_from_slice(&pair[0]);
                joined[32..].copy_from_slice(&pair[1]);
                double_sha256(&joined).to_le_bytes()
            })
            .collect();
    }

    Sha256Hash::from_le_bytes(level[0])
}

fn put_compact_size(buf: &mut impl BufMut, value: u64) {
    match value {
        0..=0xfc => buf.put_u8(value as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(value);
        }
    }
}

fn read_compact_size(buf: &mut impl Buf) -> DecodeResult<u64> {
    ensure_remaining(buf.remaining(), 1)?;
    let value = match buf.get_u8() {
        0xfd => {
            ensure_remaining(buf.remaining(), 2)?;
            buf.get_u16_le() as u64
        }
        0xfe => {
            ensure_remaining(buf.remaining(), 4)?;
            buf.get_u32_le() as u64
        }
        0xff => {
            ensure_remaining(buf.remaining(), 8)?;
            buf.get_u64_le()
        }
        small => small as u64,
    };
    Ok(value)
}

fn ensure_remaining(remaining: usize, needed: usize) -> DecodeResult<()> {
    if remaining < needed {
        return Err(DecodeError::UnexpectedEnd { needed, remaining });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(tx_count: u8) -> Block {
        let transactions: Vec<_> = (0..tx_count)
            .map(|i| Transaction::from_bytes(vec![i; 40 + i as usize]))
            .collect();
        let mut header = BlockHeader {
            version: 1,
            previous_block_hash: double_sha256(b"parent"),
            merkle_root: Sha256Hash::ZERO,
            timestamp: 1_600_000_000,
            difficulty_bits: 0x207fffff,
            nonce: 7,
        };
        header.merkle_root = merkle_root(
            &transactions.iter().map(|tx| tx.hash()).collect::<Vec<_>>(),
        );
        Block::new(header, transactions)
    }

    #[test]
    fn test_payload_roundtrip() {
        let block = sample_block(5);
        let decoded = Block::from_bytes(&block.to_bytes()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_single_transaction_merkle_root_is_txid() {
        let block = sample_block(1);
        assert_eq!(block.header.merkle_root, block.transactions[0].hash());
        assert!(block.has_valid_merkle_root());
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let hashes = vec![double_sha256(b"a"), double_sha256(b"b"), double_sha256(b"c")];
        let padded = vec![hashes[0], hashes[1], hashes[2], hashes[2]];
        assert_eq!(merkle_root(&hashes), merkle_root(&padded));
    }

    #[test]
    fn test_merkle_root_detects_reordering() {
        let mut block = sample_block(4);
        assert!(block.has_valid_merkle_root());
        block.transactions.swap(1, 2);
        assert!(!block.has_valid_merkle_root());
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let bytes = sample_block(3).to_bytes();
        let result = Block::from_bytes(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(DecodeError::UnexpectedEnd { .. })));
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(Block::from_bytes(b"not a block").is_err());
        assert!(Block::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_compact_size_boundaries() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = BytesMut::new();
            put_compact_size(&mut buf, value);
            let mut frozen = buf.freeze();
            assert_eq!(read_compact_size(&mut frozen).unwrap(), value);
            assert!(!frozen.has_remaining());
        }
    }
}
