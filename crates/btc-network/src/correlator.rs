//! Request/response correlation.
//!
//! Every outstanding request is a record in one table keyed by
//! [`RequestId`]. Whoever removes the record owns its outcome: a routed
//! reply, a peer failure, or the awaiting side's deadline. That makes each
//! request resolve exactly once, and a reply arriving after its record is
//! gone is simply not routed.

use crate::{Message, PeerId, RequestError, ThinBlock};
use btc_types::{Block, BlockHeaderWithTransactionCount, Sha256Hash, Transaction};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Identifier of an outstanding request.
pub type RequestId = u64;

/// What reply resolves a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// A `Block` with this hash.
    Block(Sha256Hash),
    /// A `ThinBlock` whose header has this hash.
    ThinBlock(Sha256Hash),
    /// `ThinTransactions` for this block.
    ThinTransactions(Sha256Hash),
    /// Any `BlockHeaders`.
    BlockHeaders,
    /// One `Transaction` message per listed hash.
    Transactions(Vec<Sha256Hash>),
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Block(Block),
    ThinBlock(ThinBlock),
    ThinTransactions(Vec<Transaction>),
    BlockHeaders(Vec<BlockHeaderWithTransactionCount>),
    Transactions(Vec<Transaction>),
}

type Reply = Result<Response, RequestError>;

struct PendingRequest {
    peer: PeerId,
    expectation: Expectation,
    /// Transaction hashes still owed.
    outstanding: HashSet<Sha256Hash>,
    collected: Vec<Transaction>,
    reply: oneshot::Sender<Reply>,
}

impl PendingRequest {
    fn accepts(&self, message: &Message) -> bool {
        match (&self.expectation, message) {
            (Expectation::Block(hash), Message::Block(block)) => block.hash() == *hash,
            (Expectation::ThinBlock(hash), Message::ThinBlock(thin)) => thin.header.hash() == *hash,
            (
                Expectation::ThinTransactions(hash),
                Message::ThinTransactions { block_hash, .. },
            ) => block_hash == hash,
            (Expectation::BlockHeaders, Message::BlockHeaders { .. }) => true,
            (Expectation::Transactions(_), Message::Transaction(tx)) => {
                self.outstanding.contains(&tx.hash())
            }
            (_, Message::NotFound { hashes }) => self.is_denied_by(hashes),
            _ => false,
        }
    }

    fn is_denied_by(&self, hashes: &[Sha256Hash]) -> bool {
        match &self.expectation {
            Expectation::Block(hash)
            | Expectation::ThinBlock(hash)
            | Expectation::ThinTransactions(hash) => hashes.contains(hash),
            Expectation::Transactions(_) => hashes.iter().any(|h| self.outstanding.contains(h)),
            Expectation::BlockHeaders => false,
        }
    }

    fn resolve(self, reply: Reply) {
        // The awaiting side may already have given up.
        let _ = self.reply.send(reply);
    }
}

/// An issued request, awaited with [`RequestCorrelator::wait`].
#[derive(Debug)]
pub struct RequestTicket {
    id: RequestId,
    peer: PeerId,
    deadline: Instant,
    rx: oneshot::Receiver<Reply>,
}

impl RequestTicket {
    /// Request identifier.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Peer the request is bound to.
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

/// Table of outstanding requests.
pub struct RequestCorrelator {
    timeout: Duration,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl RequestCorrelator {
    /// Create a correlator whose requests expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a request bound to `peer` before it is sent.
    pub fn register(&self, peer: PeerId, expectation: Expectation) -> RequestTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let outstanding = match &expectation {
            Expectation::Transactions(hashes) => hashes.iter().copied().collect(),
            _ => HashSet::new(),
        };

        self.pending.lock().insert(
            id,
            PendingRequest {
                peer,
                expectation,
                outstanding,
                collected: Vec::new(),
                reply,
            },
        );
        trace!(request = id, peer = %peer, "Registered request");

        RequestTicket {
            id,
            peer,
            deadline: Instant::now() + self.timeout,
            rx,
        }
    }

    /// Drop a request that was never sent.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Wait for the reply, a failure, or the deadline.
    pub async fn wait(&self, ticket: RequestTicket) -> Result<Response, RequestError> {
        let RequestTicket {
            id,
            peer,
            deadline,
            mut rx,
        } = ticket;

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RequestError::PeerDisconnected),
            Err(_) => {
                if self.pending.lock().remove(&id).is_some() {
                    debug!(request = id, peer = %peer, "Request timed out");
                    return Err(RequestError::Timeout);
                }
                // Resolved concurrently with the deadline.
                rx.try_recv().unwrap_or(Err(RequestError::Timeout))
            }
        }
    }

    /// Route an incoming message to the oldest matching request from `peer`.
    ///
    /// Returns the message back if no request wanted it.
    pub fn on_message(&self, peer: PeerId, message: Message) -> Option<Message> {
        let mut pending = self.pending.lock();
        let matched = pending
            .iter()
            .filter(|(_, request)| request.peer == peer && request.accepts(&message))
            .map(|(id, _)| *id)
            .min();
        let Some(id) = matched else {
            return Some(message);
        };

        match message {
            Message::Transaction(tx) => {
                let finished = match pending.get_mut(&id) {
                    Some(request) => {
                        request.outstanding.remove(&tx.hash());
                        request.collected.push(tx);
                        request.outstanding.is_empty()
                    }
                    None => false,
                };
                if finished {
                    if let Some(mut request) = pending.remove(&id) {
                        drop(pending);
                        let transactions = std::mem::take(&mut request.collected);
                        request.resolve(Ok(Response::Transactions(transactions)));
                    }
                }
            }
            Message::NotFound { .. } => {
                if let Some(request) = pending.remove(&id) {
                    drop(pending);
                    request.resolve(Err(RequestError::NotFound));
                }
            }
            other => {
                if let Some(request) = pending.remove(&id) {
                    drop(pending);
                    match into_response(other) {
                        Some(response) => request.resolve(Ok(response)),
                        None => request.resolve(Err(RequestError::InvalidResponse(
                            "unexpected message".to_string(),
                        ))),
                    }
                }
            }
        }
        None
    }

    /// Fail every request bound to `peer`.
    pub fn fail_peer(&self, peer: PeerId) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, request)| request.peer == peer)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        let count = failed.len();
        for request in failed {
            request.resolve(Err(RequestError::PeerDisconnected));
        }
        if count > 0 {
            debug!(peer = %peer, count, "Failed outstanding requests");
        }
        count
    }

    /// Number of outstanding requests.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

fn into_response(message: Message) -> Option<Response> {
    match message {
        Message::Block(block) => Some(Response::Block(*block)),
        Message::ThinBlock(thin) => Some(Response::ThinBlock(*thin)),
        Message::ThinTransactions { transactions, .. } => {
            Some(Response::ThinTransactions(transactions))
        }
        Message::BlockHeaders { headers } => Some(Response::BlockHeaders(headers)),
        _ => None,
    }
}
