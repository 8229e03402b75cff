//! Block locator ("block finder") construction.

use btc_storage::{ChainStore, StorageResult};
use btc_types::Sha256Hash;

/// Hashes listed one by one before the step starts doubling.
const DENSE_LOCATOR_COUNT: u64 = 10;

/// Build the block finder for the best header chain.
///
/// The most recent [`DENSE_LOCATOR_COUNT`] hashes come one by one, then
/// the step doubles each time. Genesis is always the last entry. An empty
/// chain yields an empty list.
pub fn block_finder_hashes<C: ChainStore + ?Sized>(chain: &C) -> StorageResult<Vec<Sha256Hash>> {
    let Some(head) = chain.head_header_id()? else {
        return Ok(Vec::new());
    };
    let Some(head_height) = chain.height_of(head)? else {
        return Ok(Vec::new());
    };

    let mut hashes = Vec::new();
    let mut height = head_height;
    let mut step = 1u64;
    loop {
        if let Some(hash) = chain
            .ancestor_at(head, height)?
            .and_then(|id| chain.hash_of(id).transpose())
            .transpose()?
        {
            hashes.push(hash);
        }
        if height == 0 {
            break;
        }
        if hashes.len() as u64 >= DENSE_LOCATOR_COUNT {
            step *= 2;
        }
        height = height.saturating_sub(step);
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use btc_storage::MemoryDatabase;
    use btc_types::{genesis_block, Block, BlockHeader, Transaction};

    fn child(parent: &Block, nonce: u32) -> Block {
        let tx = Transaction::from_bytes(nonce.to_le_bytes().to_vec());
        let mut block = Block::new(
            BlockHeader {
                version: 1,
                previous_block_hash: parent.hash(),
                merkle_root: Default::default(),
                timestamp: parent.header.timestamp + 600,
                difficulty_bits: parent.header.difficulty_bits,
                nonce,
            },
            vec![tx],
        );
        block.header.merkle_root = block.calculate_merkle_root();
        block
    }

    #[test]
    fn test_empty_chain() {
        let db = MemoryDatabase::new();
        assert!(block_finder_hashes(&db).unwrap().is_empty());
    }

    #[test]
    fn test_locator_shape() {
        let db = MemoryDatabase::new();
        let mut blocks = vec![genesis_block()];
        db.store_block(&blocks[0]).unwrap();
        for i in 1..=40u32 {
            let block = child(&blocks[blocks.len() - 1], i);
            db.store_block(&block).unwrap();
            blocks.push(block);
        }

        let hashes = block_finder_hashes(&db).unwrap();
        let expected_heights = [40, 39, 38, 37, 36, 35, 34, 33, 32, 31, 29, 25, 17, 1, 0];
        let expected: Vec<_> = expected_heights.iter().map(|h| blocks[*h].hash()).collect();
        assert_eq!(hashes, expected);
    }

    #[test]
    fn test_genesis_only() {
        let db = MemoryDatabase::new();
        db.store_block(&genesis_block()).unwrap();
        assert_eq!(block_finder_hashes(&db).unwrap(), vec![genesis_block().hash()]);
    }
}
