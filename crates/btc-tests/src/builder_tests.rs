//! Chain assembly tests.

use crate::{
    block_with_bad_merkle_root, build_chain, sibling_pair, unique_transaction, TestNetwork,
};
use btc_network::{Message, SynchronizationStatus};
use btc_storage::{ChainStore, PendingBlockStore};
use btc_sync::{
    BlockDownloadRequester, BlockchainBuilder, BuilderConfig, ChainStoreProcessor,
    ChainSynchronizationStatus, SleepyWorker, WorkerHandle,
};
use btc_types::{
    double_sha256, genesis_block, Block, NodeFeatures, Sha256Hash, GENESIS_BLOCK_HASH,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Fixture {
    network: TestNetwork,
    builder: BlockchainBuilder,
}

impl Fixture {
    fn new() -> Self {
        let network = TestNetwork::new();
        let downloader = WorkerHandle::new("block-downloader");
        let requester = BlockDownloadRequester::new(network.store.clone(), downloader.clone());
        let builder = BlockchainBuilder::new(
            BuilderConfig::default(),
            network.store.clone(),
            Arc::new(ChainStoreProcessor::new(network.store.clone())),
            network.manager.clone(),
            Arc::new(downloader),
            requester,
        );
        Self { network, builder }
    }

    fn add_pending(&self, blocks: &[&Block]) {
        for block in blocks {
            self.network.db.store(block).unwrap();
        }
    }

    fn is_pending(&self, hash: &Sha256Hash) -> bool {
        self.network.db.pending_block_id(hash).unwrap().is_some()
    }

    fn has_block(&self, hash: &Sha256Hash) -> bool {
        self.network.db.has_block_data(hash).unwrap()
    }

    fn head_height(&self) -> Option<u64> {
        let head = self.network.db.head_block_id().unwrap()?;
        self.network.db.height_of(head).unwrap()
    }
}

#[tokio::test]
async fn test_pending_genesis_is_committed() {
    let fixture = Fixture::new();
    fixture.add_pending(&[&genesis_block()]);

    assert!(!fixture.builder.run_cycle().await);

    assert!(fixture.builder.has_genesis());
    assert!(fixture.has_block(&GENESIS_BLOCK_HASH));
    assert!(!fixture.is_pending(&GENESIS_BLOCK_HASH));
    assert_eq!(fixture.head_height(), Some(0));
}

#[tokio::test]
async fn test_missing_genesis_is_requested() {
    let fixture = Fixture::new();

    assert!(!fixture.builder.run_cycle().await);

    assert!(!fixture.builder.has_genesis());
    assert!(fixture.is_pending(&GENESIS_BLOCK_HASH));
    assert_eq!(fixture.head_height(), None);
}

#[tokio::test]
async fn test_foreign_payload_at_genesis_slot_is_discarded() {
    let fixture = Fixture::new();
    let other = build_chain(1).remove(1);
    fixture
        .network
        .db
        .store_payload(&GENESIS_BLOCK_HASH, None, &other.to_bytes())
        .unwrap();

    assert!(!fixture.builder.run_cycle().await);

    assert!(!fixture.builder.has_genesis());
    assert!(!fixture.is_pending(&GENESIS_BLOCK_HASH));
    assert!(!fixture.has_block(&GENESIS_BLOCK_HASH));
    assert!(!fixture.has_block(&other.hash()));
    assert_eq!(fixture.network.db.header_count(), 0);
}

#[tokio::test]
async fn test_genesis_with_bad_merkle_root_is_discarded() {
    let fixture = Fixture::new();
    let mut tampered = genesis_block();
    tampered.transactions.push(unique_transaction());
    assert_eq!(tampered.hash(), GENESIS_BLOCK_HASH);
    fixture
        .network
        .db
        .store_payload(&GENESIS_BLOCK_HASH, None, &tampered.to_bytes())
        .unwrap();

    assert!(!fixture.builder.run_cycle().await);

    assert!(!fixture.builder.has_genesis());
    assert!(!fixture.is_pending(&GENESIS_BLOCK_HASH));
    assert!(!fixture.has_block(&GENESIS_BLOCK_HASH));
    assert_eq!(fixture.network.db.header_count(), 0);
}

#[tokio::test]
async fn test_undecodable_payload_is_deleted() {
    let fixture = Fixture::new();
    fixture.network.store_chain(&build_chain(0));
    let hash = double_sha256(b"undecodable payload");
    fixture
        .network
        .db
        .store_payload(&hash, Some(GENESIS_BLOCK_HASH), &[0xde, 0xad, 0xbe, 0xef])
        .unwrap();

    assert!(fixture.builder.run_cycle().await);

    assert!(!fixture.is_pending(&hash));
    assert!(!fixture.has_block(&hash));
    assert_eq!(fixture.head_height(), Some(0));
    assert_eq!(fixture.network.db.header_count(), 1);
}

#[tokio::test]
async fn test_payload_for_another_hash_is_deleted() {
    let fixture = Fixture::new();
    let chain = build_chain(1);
    fixture.network.store_chain(&chain[..1]);
    let hash = double_sha256(b"mislabelled payload");
    fixture
        .network
        .db
        .store_payload(&hash, Some(GENESIS_BLOCK_HASH), &chain[1].to_bytes())
        .unwrap();

    assert!(fixture.builder.run_cycle().await);

    assert!(!fixture.is_pending(&hash));
    assert!(!fixture.has_block(&chain[1].hash()));
    assert_eq!(fixture.head_height(), Some(0));
}

#[tokio::test]
async fn test_out_of_order_downloads_assemble_in_order() {
    let fixture = Fixture::new();
    let chain = build_chain(4);
    fixture.network.store_chain(&chain[..1]);
    fixture.add_pending(&[&chain[3], &chain[1], &chain[4], &chain[2]]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    fixture
        .builder
        .set_new_block_processed_callback(Arc::new(move |height, block| {
            let _ = tx.send((height, block.hash()));
        }));

    assert!(fixture.builder.run_cycle().await);

    assert_eq!(fixture.head_height(), Some(4));
    assert_eq!(fixture.network.db.pending_block_count(), 0);
    assert!(ChainSynchronizationStatus::new(fixture.network.store.clone())
        .is_blockchain_synchronized());

    let mut processed = Vec::new();
    for _ in 0..4 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        processed.push(event);
    }
    processed.sort();
    let expected: Vec<(u64, Sha256Hash)> = chain[1..]
        .iter()
        .enumerate()
        .map(|(i, b)| (i as u64 + 1, b.hash()))
        .collect();
    assert_eq!(processed, expected);
}

#[tokio::test]
async fn test_gap_stops_assembly() {
    let fixture = Fixture::new();
    let chain = build_chain(3);
    fixture.network.store_chain(&chain[..1]);
    fixture.add_pending(&[&chain[1], &chain[3]]);

    assert!(fixture.builder.run_cycle().await);
    assert!(!fixture.builder.run_cycle().await);

    assert_eq!(fixture.head_height(), Some(1));
    assert!(fixture.is_pending(&chain[3].hash()));
    assert!(!fixture.has_block(&chain[3].hash()));
}

#[tokio::test]
async fn test_rejected_block_is_deleted() {
    let fixture = Fixture::new();
    let chain = build_chain(0);
    fixture.network.store_chain(&chain);
    let bad = block_with_bad_merkle_root(&chain[0], 5);
    fixture.add_pending(&[&bad]);

    assert!(fixture.builder.run_cycle().await);

    assert!(!fixture.is_pending(&bad.hash()));
    assert!(!fixture.has_block(&bad.hash()));
    assert_eq!(fixture.head_height(), Some(0));
    assert!(!fixture.builder.run_cycle().await);
}

#[tokio::test]
async fn test_fork_takes_lowest_hash_first() {
    let fixture = Fixture::new();
    let chain = build_chain(1);
    fixture.network.store_chain(&chain[..1]);
    let (low, high) = sibling_pair(&chain[1]);
    fixture.add_pending(&[&high, &chain[1], &low]);

    assert!(fixture.builder.run_cycle().await);
    assert!(fixture.has_block(&low.hash()));
    assert!(!fixture.has_block(&high.hash()));
    assert!(fixture.is_pending(&high.hash()));

    // The sibling is applied on a later pass.
    assert!(fixture.builder.run_cycle().await);
    assert!(fixture.has_block(&high.hash()));
    assert_eq!(fixture.network.db.pending_block_count(), 0);
}

#[tokio::test]
async fn test_next_known_header_is_requested() {
    let fixture = Fixture::new();
    let chain = build_chain(2);
    fixture.network.store_chain(&chain[..1]);
    fixture.network.db.store_header(&chain[1].header).unwrap();
    fixture.network.db.store_header(&chain[2].header).unwrap();

    assert!(!fixture.builder.run_cycle().await);

    assert!(fixture.is_pending(&chain[1].hash()));
    assert!(!fixture.is_pending(&chain[2].hash()));
    assert!(!ChainSynchronizationStatus::new(fixture.network.store.clone())
        .is_blockchain_synchronized());
}

#[tokio::test]
async fn test_idle_builder_broadcasts_block_finder() {
    let fixture = Fixture::new();
    fixture.network.store_chain(&build_chain(2));
    let peer = fixture
        .network
        .connect_peer("10.5.0.1:8333", NodeFeatures::full_node());
    fixture.network.settle().await;
    fixture.network.clear_log();

    fixture.builder.on_sleep().await;
    fixture.network.settle().await;

    let sent = fixture.network.sent_messages();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        &sent[0],
        (to, Message::BlockFinder { block_hashes }) if *to == peer && block_hashes.len() == 3
    ));
}
