//! Thin block reconciliation.
//!
//! A thin block carries a header, every transaction hash and whatever
//! transactions the sender guessed we lack. [`ThinBlockAssembler`] resolves
//! the rest from the mempool; [`ThinBlockReconciliation`] drives the rounds
//! for one requested hash:
//!
//! ```text
//! Requested --thin block, all resolved--------------------> Done (emit)
//! Requested --thin block, partial--> AwaitingMissingTx
//! AwaitingMissingTx --transactions--> Reassembling --ok---> Done (emit)
//!                                                  --bad--> FallbackRequested
//! any non-terminal state --failure or mismatch-----------> FallbackRequested
//! ```
//!
//! The machine only decides. Sending requests is the caller's job.

use crate::{MemoryPoolEnquirer, RequestError, ThinBlock};
use btc_types::{Block, BlockHeader, Sha256Hash, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A thin block with some transactions still unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinBlockAssembly {
    header: BlockHeader,
    transaction_hashes: Vec<Sha256Hash>,
    known: HashMap<Sha256Hash, Transaction>,
    missing: Vec<Sha256Hash>,
}

impl ThinBlockAssembly {
    /// Hash of the block being assembled.
    pub fn block_hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    /// Hashes still unresolved, in block order.
    pub fn missing(&self) -> &[Sha256Hash] {
        &self.missing
    }
}

/// Result of a first assembly attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// Every transaction resolved and the merkle root matches.
    Complete(Block),
    /// Some transactions are missing.
    Partial(ThinBlockAssembly),
    /// Every transaction resolved but the result is not a valid block.
    Invalid,
}

/// Resolves thin block transactions against the local mempool.
#[derive(Clone)]
pub struct ThinBlockAssembler {
    mempool: Arc<dyn MemoryPoolEnquirer>,
}

impl ThinBlockAssembler {
    pub fn new(mempool: Arc<dyn MemoryPoolEnquirer>) -> Self {
        Self { mempool }
    }

    /// Resolve every hash against the included transactions and the mempool.
    pub fn assemble(&self, thin: ThinBlock) -> Assembly {
        let ThinBlock {
            header,
            transaction_hashes,
            transactions,
        } = thin;

        let mut known: HashMap<Sha256Hash, Transaction> = transactions
            .into_iter()
            .map(|tx| (tx.hash(), tx))
            .collect();
        let mut missing = Vec::new();
        for hash in &transaction_hashes {
            if known.contains_key(hash) {
                continue;
            }
            match self.mempool.transaction(hash) {
                Some(tx) => {
                    known.insert(*hash, tx);
                }
                None if !missing.contains(hash) => missing.push(*hash),
                None => {}
            }
        }

        if missing.is_empty() {
            return match build_block(&header, &transaction_hashes, &known) {
                Some(block) => Assembly::Complete(block),
                None => Assembly::Invalid,
            };
        }

        Assembly::Partial(ThinBlockAssembly {
            header,
            transaction_hashes,
            known,
            missing,
        })
    }

    /// Finish an assembly with the transactions returned for its missing
    /// hashes. `None` if any are still missing or the result is invalid.
    pub fn reassemble(
        &self,
        mut assembly: ThinBlockAssembly,
        transactions: Vec<Transaction>,
    ) -> Option<Block> {
        for tx in transactions {
            assembly.known.insert(tx.hash(), tx);
        }
        build_block(
            &assembly.header,
            &assembly.transaction_hashes,
            &assembly.known,
        )
    }
}

fn build_block(
    header: &BlockHeader,
    transaction_hashes: &[Sha256Hash],
    known: &HashMap<Sha256Hash, Transaction>,
) -> Option<Block> {
    let transactions = transaction_hashes
        .iter()
        .map(|hash| known.get(hash).cloned())
        .collect::<Option<Vec<_>>>()?;
    let block = Block::new(header.clone(), transactions);
    block.has_valid_merkle_root().then_some(block)
}

/// Reconciliation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThinBlockState {
    /// Thin block requested, nothing received yet.
    Requested,
    /// Waiting for the transactions the first attempt could not resolve.
    AwaitingMissingTx(ThinBlockAssembly),
    /// Rebuilding the block from the missing-transaction reply.
    Reassembling,
    /// Gave up; the caller downloads the full block.
    FallbackRequested,
    /// Block assembled and emitted.
    Done,
}

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum ThinBlockEvent {
    ThinBlockReceived(ThinBlock),
    MissingTransactionsReceived(Vec<Transaction>),
    RequestFailed(RequestError),
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThinBlockAction {
    /// Ask a peer for these transactions.
    RequestMissing(Vec<Sha256Hash>),
    /// Download the full block instead.
    FallbackToFullBlock,
    /// Hand this block to the original caller.
    Emit(Block),
    /// Nothing to do; the reconciliation already finished.
    None,
}

/// One thin block reconciliation attempt.
pub struct ThinBlockReconciliation {
    block_hash: Sha256Hash,
    state: ThinBlockState,
    assembler: ThinBlockAssembler,
}

impl ThinBlockReconciliation {
    pub fn new(block_hash: Sha256Hash, assembler: ThinBlockAssembler) -> Self {
        Self {
            block_hash,
            state: ThinBlockState::Requested,
            assembler,
        }
    }

    /// Requested block hash.
    pub fn block_hash(&self) -> Sha256Hash {
        self.block_hash
    }

    /// Current state.
    pub fn state(&self) -> &ThinBlockState {
        &self.state
    }

    /// Whether no further event can change the outcome.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            ThinBlockState::Done | ThinBlockState::FallbackRequested
        )
    }

    /// Advance the machine.
    pub fn handle(&mut self, event: ThinBlockEvent) -> ThinBlockAction {
        if self.is_finished() {
            return ThinBlockAction::None;
        }

        let state = std::mem::replace(&mut self.state, ThinBlockState::Reassembling);
        match (state, event) {
            (ThinBlockState::Requested, ThinBlockEvent::ThinBlockReceived(thin)) => {
                if thin.header.hash() != self.block_hash {
                    return self.fall_back("thin block hash mismatch");
                }
                match self.assembler.assemble(thin) {
                    Assembly::Complete(block) => self.emit(block),
                    Assembly::Partial(assembly) => {
                        let missing = assembly.missing().to_vec();
                        debug!(
                            hash = %self.block_hash,
                            missing = missing.len(),
                            "Thin block partially resolved"
                        );
                        self.state = ThinBlockState::AwaitingMissingTx(assembly);
                        ThinBlockAction::RequestMissing(missing)
                    }
                    Assembly::Invalid => self.fall_back("thin block merkle root mismatch"),
                }
            }
            (
                ThinBlockState::AwaitingMissingTx(assembly),
                ThinBlockEvent::MissingTransactionsReceived(transactions),
            ) => match self.assembler.reassemble(assembly, transactions) {
                Some(block) if block.hash() == self.block_hash => self.emit(block),
                _ => self.fall_back("thin block reassembly failed"),
            },
            (_, ThinBlockEvent::RequestFailed(error)) => {
                debug!(hash = %self.block_hash, error = %error, "Thin block request failed");
                self.fall_back("request failed")
            }
            _ => self.fall_back("unexpected reply"),
        }
    }

    fn emit(&mut self, block: Block) -> ThinBlockAction {
        self.state = ThinBlockState::Done;
        ThinBlockAction::Emit(block)
    }

    fn fall_back(&mut self, reason: &str) -> ThinBlockAction {
        debug!(hash = %self.block_hash, reason, "Falling back to full block download");
        self.state = ThinBlockState::FallbackRequested;
        ThinBlockAction::FallbackToFullBlock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmptyMemoryPool;
    use btc_types::{genesis_block, BloomFilter};

    struct StaticPool(HashMap<Sha256Hash, Transaction>);

    impl MemoryPoolEnquirer for StaticPool {
        fn bloom_filter(&self, _block_hash: &Sha256Hash) -> BloomFilter {
            BloomFilter::empty()
        }

        fn transaction_count(&self) -> usize {
            self.0.len()
        }

        fn transaction(&self, hash: &Sha256Hash) -> Option<Transaction> {
            self.0.get(hash).cloned()
        }
    }

    fn block_with_transactions(count: u8) -> Block {
        let transactions: Vec<_> = (0..count)
            .map(|i| Transaction::from_bytes(vec![i; 40]))
            .collect();
        let mut block = Block::new(genesis_block().header, transactions);
        block.header.previous_block_hash = genesis_block().hash();
        block.header.merkle_root = block.calculate_merkle_root();
        block
    }

    fn assembler(pool: Vec<Transaction>) -> ThinBlockAssembler {
        ThinBlockAssembler::new(Arc::new(StaticPool(
            pool.into_iter().map(|tx| (tx.hash(), tx)).collect(),
        )))
    }

    #[test]
    fn test_complete_from_mempool() {
        let block = block_with_transactions(4);
        let mut reconciliation = ThinBlockReconciliation::new(
            block.hash(),
            assembler(block.transactions[1..].to_vec()),
        );

        let thin = ThinBlock::from_block(&block, |tx| tx == &block.transactions[0]);
        let action = reconciliation.handle(ThinBlockEvent::ThinBlockReceived(thin));

        assert_eq!(action, ThinBlockAction::Emit(block));
        assert_eq!(reconciliation.state(), &ThinBlockState::Done);
    }

    #[test]
    fn test_missing_round_then_emit() {
        let block = block_with_transactions(5);
        let mut reconciliation = ThinBlockReconciliation::new(
            block.hash(),
            assembler(vec![block.transactions[1].clone()]),
        );

        let thin = ThinBlock::from_block(&block, |tx| tx == &block.transactions[0]);
        let action = reconciliation.handle(ThinBlockEvent::ThinBlockReceived(thin));
        let expected: Vec<_> = block.transactions[2..].iter().map(|tx| tx.hash()).collect();
        assert_eq!(action, ThinBlockAction::RequestMissing(expected));
        assert!(matches!(
            reconciliation.state(),
            ThinBlockState::AwaitingMissingTx(_)
        ));

        let action = reconciliation.handle(ThinBlockEvent::MissingTransactionsReceived(
            block.transactions[2..].to_vec(),
        ));
        assert_eq!(action, ThinBlockAction::Emit(block));
    }

    #[test]
    fn test_incomplete_missing_round_falls_back() {
        let block = block_with_transactions(3);
        let assembler = ThinBlockAssembler::new(Arc::new(EmptyMemoryPool));
        let mut reconciliation = ThinBlockReconciliation::new(block.hash(), assembler);

        let thin = ThinBlock::from_block(&block, |_| false);
        reconciliation.handle(ThinBlockEvent::ThinBlockReceived(thin));
        let action = reconciliation.handle(ThinBlockEvent::MissingTransactionsReceived(
            block.transactions[..1].to_vec(),
        ));

        assert_eq!(action, ThinBlockAction::FallbackToFullBlock);
        assert_eq!(reconciliation.state(), &ThinBlockState::FallbackRequested);
    }

    #[test]
    fn test_wrong_block_falls_back() {
        let block = block_with_transactions(2);
        let other = genesis_block();
        let mut reconciliation = ThinBlockReconciliation::new(block.hash(), assembler(vec![]));

        let thin = ThinBlock::from_block(&other, |_| true);
        let action = reconciliation.handle(ThinBlockEvent::ThinBlockReceived(thin));
        assert_eq!(action, ThinBlockAction::FallbackToFullBlock);
    }

    #[test]
    fn test_tampered_transaction_falls_back() {
        let block = block_with_transactions(2);
        let mut reconciliation = ThinBlockReconciliation::new(block.hash(), assembler(vec![]));

        let mut thin = ThinBlock::from_block(&block, |_| true);
        let forged = Transaction::from_bytes(vec![0xff; 40]);
        thin.transaction_hashes[1] = forged.hash();
        thin.transactions[1] = forged;

        let action = reconciliation.handle(ThinBlockEvent::ThinBlockReceived(thin));
        assert_eq!(action, ThinBlockAction::FallbackToFullBlock);
    }

    #[test]
    fn test_finished_machine_ignores_events() {
        let block = block_with_transactions(2);
        let mut reconciliation = ThinBlockReconciliation::new(block.hash(), assembler(vec![]));

        let action = reconciliation.handle(ThinBlockEvent::RequestFailed(RequestError::Timeout));
        assert_eq!(action, ThinBlockAction::FallbackToFullBlock);

        let thin = ThinBlock::from_block(&block, |_| true);
        let action = reconciliation.handle(ThinBlockEvent::ThinBlockReceived(thin));
        assert_eq!(action, ThinBlockAction::None);
        assert!(reconciliation.is_finished());
    }
}
