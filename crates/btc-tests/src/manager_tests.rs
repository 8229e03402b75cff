//! Connection manager tests against simulated peers.

use crate::{build_chain, peer_addr, silent, BlockServer, TestNetwork};
use btc_network::{
    AddNodeOutcome, HandshakeInfo, Message, NetworkCommand, NetworkError, PeerId, RequestError,
};
use btc_storage::PendingBlockStore;
use btc_types::{NodeFeature, NodeFeatures, GENESIS_BLOCK_HASH};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Peer lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_ban_disconnects_even_when_persisting_fails() {
    let network = TestNetwork::new();
    let peer = network.connect_peer("10.2.0.1:8333", NodeFeatures::full_node());
    let ip: IpAddr = "10.2.0.1".parse().unwrap();

    network.peer_store.fail_writes(true);
    network.manager.ban_node(ip);
    network.settle().await;

    assert_eq!(network.manager.active_node_count(), 0);
    assert!(network
        .commands()
        .contains(&NetworkCommand::Disconnect { peer }));

    // The ban never reached storage.
    assert_eq!(
        network.manager.add_node(peer.addr()),
        AddNodeOutcome::Added
    );
}

#[tokio::test(start_paused = true)]
async fn test_ban_during_handshake_prevents_promotion() {
    let network = TestNetwork::new();
    let ip: IpAddr = "10.2.0.20".parse().unwrap();
    let manager = Arc::downgrade(&network.manager);
    network.peer_store.on_handshake_write(Arc::new(move |_| {
        if let Some(manager) = manager.upgrade() {
            manager.ban_node(ip);
        }
    }));

    let peer = network.connect_peer_with(
        "10.2.0.20:8333",
        HandshakeInfo {
            features: NodeFeatures::full_node(),
            ..Default::default()
        },
    );
    network.settle().await;

    assert_eq!(network.manager.active_node_count(), 0);
    assert!(network
        .commands()
        .contains(&NetworkCommand::Disconnect { peer }));
    assert_eq!(
        network.manager.add_node(peer.addr()),
        AddNodeOutcome::Banned
    );
}

#[tokio::test(start_paused = true)]
async fn test_same_address_registered_during_handshake_is_duplicate() {
    let network = TestNetwork::new();
    let addr = peer_addr("10.2.0.21:8333");
    let outcome = Arc::new(parking_lot::Mutex::new(None));
    let manager = Arc::downgrade(&network.manager);
    let seen = outcome.clone();
    network.peer_store.on_handshake_write(Arc::new(move |_| {
        if let Some(manager) = manager.upgrade() {
            *seen.lock() = Some(manager.add_node(addr));
        }
    }));

    let peer = network.connect_peer("10.2.0.21:8333", NodeFeatures::full_node());

    assert_eq!(*outcome.lock(), Some(AddNodeOutcome::Duplicate));
    assert_eq!(network.manager.active_node_count(), 1);
    assert_eq!(network.manager.active_peers()[0].id, peer);
    assert_eq!(network.manager.add_node(addr), AddNodeOutcome::Duplicate);
}

#[tokio::test(start_paused = true)]
async fn test_all_peers_lost_redials_known_full_nodes() {
    let network = TestNetwork::new();
    let peer = network.connect_peer("10.2.0.2:8333", NodeFeatures::full_node());

    network.manager.on_disconnected(peer);
    network.settle().await;

    let dials = network
        .commands()
        .iter()
        .filter(|c| **c == NetworkCommand::Connect { addr: peer.addr() })
        .count();
    assert_eq!(dials, 2);
}

#[tokio::test(start_paused = true)]
async fn test_losing_one_of_two_peers_does_not_redial() {
    let network = TestNetwork::new();
    let a = network.connect_peer("10.2.0.3:8333", NodeFeatures::full_node());
    network.connect_peer("10.2.0.4:8333", NodeFeatures::full_node());

    network.manager.on_disconnected(a);
    network.settle().await;

    let dials = network
        .commands()
        .iter()
        .filter(|c| matches!(c, NetworkCommand::Connect { .. }))
        .count();
    assert_eq!(dials, 2);
    assert_eq!(network.manager.active_node_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_sends_block_finder() {
    let network = TestNetwork::new();
    let chain = build_chain(3);
    network.store_chain(&chain);

    let peer = network.connect_peer("10.2.0.5:8333", NodeFeatures::full_node());
    network.settle().await;

    let finder = network
        .sent_messages()
        .into_iter()
        .find_map(|(to, message)| match message {
            Message::BlockFinder { block_hashes } if to == peer => Some(block_hashes),
            _ => None,
        })
        .expect("block finder sent");
    assert_eq!(finder.first(), Some(&chain[3].hash()));
    assert_eq!(finder.last(), Some(&GENESIS_BLOCK_HASH));
}

// ============================================================================
// Inventory and announcements
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_inventory_records_pending_blocks() {
    let network = TestNetwork::new();
    let chain = build_chain(2);
    network.store_chain(&chain[..1]);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    network
        .manager
        .set_new_inventory_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

    let peer = network.connect_peer("10.2.0.6:8333", NodeFeatures::full_node());
    network.manager.on_message(
        peer,
        Message::BlockInventory {
            block_hashes: chain.iter().map(|b| b.hash()).collect(),
        },
    );

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(network.db.pending_block_id(&GENESIS_BLOCK_HASH).unwrap(), None);
    assert!(network.db.pending_block_id(&chain[1].hash()).unwrap().is_some());
    assert!(network.db.pending_block_id(&chain[2].hash()).unwrap().is_some());

    // Nothing new: only the stored genesis block.
    network.manager.on_message(
        peer,
        Message::BlockInventory {
            block_hashes: vec![GENESIS_BLOCK_HASH],
        },
    );
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transmit_block_hash_respects_announcement_preference() {
    let network = TestNetwork::new();
    let chain = build_chain(1);
    network.store_chain(&chain);

    let by_header = network.connect_peer_with(
        "10.2.0.7:8333",
        HandshakeInfo {
            features: NodeFeatures::full_node(),
            prefers_header_announcements: true,
            ..Default::default()
        },
    );
    let by_hash = network.connect_peer("10.2.0.8:8333", NodeFeatures::full_node());
    network.settle().await;
    network.clear_log();

    let hash = chain[1].hash();
    assert!(network.manager.transmit_block_hash(by_header, hash).unwrap());
    assert!(network.manager.transmit_block_hash(by_hash, hash).unwrap());
    network.settle().await;

    let sent = network.sent_messages();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[0],
        (
            by_header,
            Message::BlockHeaders {
                headers: vec![chain[1].header_with_transaction_count()]
            }
        )
    );
    assert_eq!(
        sent[1],
        (
            by_hash,
            Message::BlockInventory {
                block_hashes: vec![hash]
            }
        )
    );
}

#[tokio::test(start_paused = true)]
async fn test_transmit_block_hash_skips_unknown_blocks() {
    let network = TestNetwork::new();
    let chain = build_chain(2);
    network.store_chain(&chain[..2]);
    let peer = network.connect_peer("10.2.0.9:8333", NodeFeatures::full_node());

    assert!(!network
        .manager
        .transmit_block_hash(peer, chain[2].hash())
        .unwrap());

    let stranger = PeerId::new(peer_addr("10.2.0.10:8333"));
    assert!(matches!(
        network.manager.transmit_block_hash(stranger, chain[1].hash()),
        Err(NetworkError::PeerNotFound(p)) if p == stranger
    ));
}

#[tokio::test(start_paused = true)]
async fn test_request_block_hashes_after_queries_one_chain_peer() {
    let network = TestNetwork::new();
    assert!(!network.manager.request_block_hashes_after(GENESIS_BLOCK_HASH));

    let peer = network.connect_peer("10.2.0.17:8333", NodeFeatures::full_node());
    network.settle().await;
    network.clear_log();

    assert!(network.manager.request_block_hashes_after(GENESIS_BLOCK_HASH));
    network.settle().await;

    let sent = network.sent_messages();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        (to, Message::QueryBlocks(query)) => {
            assert_eq!(*to, peer);
            assert_eq!(query.block_hashes(), &[GENESIS_BLOCK_HASH]);
            assert_eq!(query.stop_before(), None);
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_transaction_is_penalized() {
    let network = TestNetwork::new();
    let chain = build_chain(1);
    let peer = network.connect_peer("10.2.0.11:8333", NodeFeatures::full_node());

    network.manager.on_message(
        peer,
        Message::Transaction(chain[1].transactions[0].clone()),
    );

    let node = &network.manager.active_peers()[0];
    assert_eq!(node.score.current_penalty(), 5);
}

// ============================================================================
// Correlated requests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_request_times_out() {
    let network = TestNetwork::builder()
        .request_timeout(Duration::from_secs(30))
        .build();
    network.set_responder(silent());
    network.connect_peer("10.2.0.12:8333", NodeFeatures::full_node());

    let result = network
        .manager
        .request_block(GENESIS_BLOCK_HASH, None)
        .await;

    assert_eq!(result, Err(RequestError::Timeout));
    assert_eq!(network.manager.outstanding_request_count(), 0);
    assert_eq!(
        network.manager.active_peers()[0].score.current_penalty(),
        20
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_outstanding_request() {
    let network = TestNetwork::new();
    let peer = network.connect_peer("10.2.0.13:8333", NodeFeatures::full_node());

    let manager = network.manager.clone();
    let request =
        tokio::spawn(async move { manager.request_block(GENESIS_BLOCK_HASH, None).await });
    network.settle().await;
    assert_eq!(network.manager.outstanding_request_count(), 1);

    network.manager.on_disconnected(peer);
    assert_eq!(
        request.await.unwrap(),
        Err(RequestError::PeerDisconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn test_spv_peer_is_not_used_for_blocks() {
    let network = TestNetwork::builder().synced(true).build();
    network.connect_peer(
        "10.2.0.14:8333",
        NodeFeatures::of(&[NodeFeature::BloomConnectionsEnabled]),
    );

    let result = network
        .manager
        .request_block(GENESIS_BLOCK_HASH, None)
        .await;
    assert_eq!(result, Err(RequestError::NoPeerAvailable));
}

#[tokio::test(start_paused = true)]
async fn test_request_transactions_collects_every_reply() {
    let network = TestNetwork::new();
    let chain = build_chain(1);
    network.set_responder(BlockServer::new(chain.clone()).into_responder());
    network.connect_peer("10.2.0.15:8333", NodeFeatures::full_node());

    let wanted = chain[1].transaction_hashes();
    let transactions = network
        .manager
        .request_transactions(&wanted, None)
        .await
        .unwrap();

    let mut received: Vec<_> = transactions.iter().map(|tx| tx.hash()).collect();
    let mut expected = wanted.clone();
    received.sort();
    expected.sort();
    assert_eq!(received, expected);
}

#[tokio::test(start_paused = true)]
async fn test_request_block_headers_after() {
    let network = TestNetwork::new();
    let chain = build_chain(3);
    let headers: Vec<_> = chain[1..]
        .iter()
        .map(|b| b.header_with_transaction_count())
        .collect();
    let reply = headers.clone();
    network.set_responder(Arc::new(move |_, message| match message {
        Message::RequestBlockHeaders { .. } => vec![Message::BlockHeaders {
            headers: reply.clone(),
        }],
        _ => Vec::new(),
    }));
    network.connect_peer("10.2.0.16:8333", NodeFeatures::full_node());

    let received = network
        .manager
        .request_block_headers_after(vec![GENESIS_BLOCK_HASH])
        .await
        .unwrap();
    assert_eq!(received, headers);
}
