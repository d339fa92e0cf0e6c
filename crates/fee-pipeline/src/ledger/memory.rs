//! In-memory ledger
//!
//! Reference `Ledger` used by the node binary and the tests. Finalized
//! sub-blocks are grouped into blocks of a fixed size; a block becomes
//! eligible for finalization once it is full (or sealed early) since only
//! finalized sub-blocks ever join one.

use crate::error::LedgerError;
use crate::ports::Ledger;
use crate::tags::sub_block_digest;
use async_trait::async_trait;
use parking_lot::RwLock;
use pipeline_types::{
    Block, BlockId, DistributionRecord, FinalizationTag, FinalizeTarget, RefundKind, RefundRecord,
    Sealed, SubBlock, SubBlockId, Transaction, TxId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Counters exposed for monitoring and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub sub_blocks: usize,
    pub blocks: usize,
    /// Finalize calls that changed state
    pub finalize_calls: usize,
    /// Distribution calls that created a record
    pub distribute_calls: usize,
    pub refunds: usize,
    pub pending_refunds: usize,
    pub settled: usize,
}

/// Full ledger contents, used for persistence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub sub_blocks: Vec<(SubBlock, Sealed)>,
    pub blocks: Vec<Block>,
    pub open_block: Option<BlockId>,
    pub next_block: BlockId,
    pub finalization_tags: Vec<(FinalizeTarget, FinalizationTag)>,
    pub distributions: Vec<DistributionRecord>,
    pub refunds: Vec<RefundRecord>,
    pub pending_refunds: Vec<Transaction>,
    pub actual_fees: Vec<(TxId, u64)>,
    #[serde(default)]
    pub settled: Vec<TxId>,
}

struct LedgerState {
    sub_blocks: BTreeMap<SubBlockId, SubBlock>,
    record_tags: HashMap<SubBlockId, Sealed>,
    tx_index: HashMap<TxId, SubBlockId>,
    blocks: BTreeMap<BlockId, Block>,
    open_block: Option<BlockId>,
    next_block: BlockId,
    finalization_tags: HashMap<FinalizeTarget, FinalizationTag>,
    distributions: BTreeMap<SubBlockId, DistributionRecord>,
    refunds: BTreeMap<(TxId, RefundKind), RefundRecord>,
    pending_refunds: BTreeMap<TxId, Transaction>,
    actual_fees: HashMap<TxId, u64>,
    /// Transactions whose refunds are settled; never completed again
    settled: BTreeSet<TxId>,
    finalize_calls: usize,
    distribute_calls: usize,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            sub_blocks: BTreeMap::new(),
            record_tags: HashMap::new(),
            tx_index: HashMap::new(),
            blocks: BTreeMap::new(),
            open_block: None,
            next_block: BlockId(1),
            finalization_tags: HashMap::new(),
            distributions: BTreeMap::new(),
            refunds: BTreeMap::new(),
            pending_refunds: BTreeMap::new(),
            actual_fees: HashMap::new(),
            settled: BTreeSet::new(),
            finalize_calls: 0,
            distribute_calls: 0,
        }
    }
}

impl LedgerState {
    /// Attach a freshly finalized sub-block to the open block
    fn attach_to_open_block(&mut self, id: SubBlockId, sub_blocks_per_block: usize) -> BlockId {
        let block_id = match self.open_block {
            Some(open) => open,
            None => {
                let open = self.next_block;
                self.next_block = open.next();
                self.blocks.insert(open, Block::new(open, Vec::new()));
                self.open_block = Some(open);
                open
            }
        };

        if let Some(block) = self.blocks.get_mut(&block_id) {
            block.sub_blocks.push(id);
            if block.sub_blocks.len() >= sub_blocks_per_block {
                block.validated = true;
                self.open_block = None;
                tracing::debug!("{} closed with {} sub-blocks", block_id, block.sub_blocks.len());
            }
        }
        block_id
    }

    fn is_completed(&self, tx: TxId) -> bool {
        self.pending_refunds.contains_key(&tx) || self.settled.contains(&tx)
    }
}

/// Ledger held entirely in memory
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
    sub_blocks_per_block: usize,
}

impl MemoryLedger {
    /// Blocks close after `sub_blocks_per_block` finalized sub-blocks
    pub fn new(sub_blocks_per_block: usize) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            sub_blocks_per_block: sub_blocks_per_block.max(1),
        }
    }

    pub fn sub_blocks_per_block(&self) -> usize {
        self.sub_blocks_per_block
    }

    pub fn sub_block(&self, id: SubBlockId) -> Option<SubBlock> {
        self.state.read().sub_blocks.get(&id).cloned()
    }

    pub fn block(&self, id: BlockId) -> Option<Block> {
        self.state.read().blocks.get(&id).cloned()
    }

    /// Every recorded sub-block, finalized or not
    pub fn sub_blocks(&self) -> Vec<SubBlock> {
        self.state.read().sub_blocks.values().cloned().collect()
    }

    /// Id after the highest recorded sub-block
    pub fn next_sub_block_id(&self) -> SubBlockId {
        self.state
            .read()
            .sub_blocks
            .keys()
            .next_back()
            .map(|id| id.next())
            .unwrap_or(SubBlockId(1))
    }

    pub fn distributions(&self) -> Vec<DistributionRecord> {
        self.state.read().distributions.values().cloned().collect()
    }

    pub fn refunds(&self) -> Vec<RefundRecord> {
        self.state.read().refunds.values().cloned().collect()
    }

    /// Whether the transaction was already completed, settled or not
    pub fn is_completed(&self, tx: TxId) -> bool {
        self.state.read().is_completed(tx)
    }

    pub fn completed_transactions_pending(&self) -> Vec<Transaction> {
        self.state.read().pending_refunds.values().cloned().collect()
    }

    pub fn stats(&self) -> LedgerStats {
        let state = self.state.read();
        LedgerStats {
            sub_blocks: state.sub_blocks.len(),
            blocks: state.blocks.len(),
            finalize_calls: state.finalize_calls,
            distribute_calls: state.distribute_calls,
            refunds: state.refunds.len(),
            pending_refunds: state.pending_refunds.len(),
            settled: state.settled.len(),
        }
    }

    /// Mark a recorded transaction as executed with its settled fee
    pub fn complete_transaction(
        &self,
        tx: TxId,
        gas_used: u64,
        actual_fee: u64,
    ) -> Result<Transaction, LedgerError> {
        let recorded = {
            let state = self.state.read();
            let sub_block = state
                .tx_index
                .get(&tx)
                .and_then(|id| state.sub_blocks.get(id))
                .ok_or(LedgerError::UnknownTransaction(tx))?;
            sub_block
                .transactions
                .iter()
                .find(|candidate| candidate.id == tx)
                .cloned()
                .ok_or(LedgerError::UnknownTransaction(tx))?
        };
        self.put_completed(recorded, gas_used, actual_fee)
    }

    /// Insert a completed transaction into the pending-refund set.
    ///
    /// A transaction completes once: completing it again while its refund
    /// is pending, or after it was settled, is rejected.
    pub fn put_completed(
        &self,
        mut tx: Transaction,
        gas_used: u64,
        actual_fee: u64,
    ) -> Result<Transaction, LedgerError> {
        let mut state = self.state.write();
        if state.is_completed(tx.id) {
            return Err(LedgerError::Rejected(format!("{} already completed", tx.id)));
        }

        tx.gas_used = gas_used;
        tx.receipt_generated = true;
        tx.completed = true;
        state.actual_fees.insert(tx.id, actual_fee);
        state.pending_refunds.insert(tx.id, tx.clone());
        Ok(tx)
    }

    /// Close the open block before it is full
    pub fn seal_open_block(&self) -> Option<BlockId> {
        let mut state = self.state.write();
        let open = state.open_block.take()?;
        if let Some(block) = state.blocks.get_mut(&open) {
            block.validated = true;
        }
        tracing::debug!("{} sealed early", open);
        Some(open)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.read();
        let sub_blocks = state
            .sub_blocks
            .values()
            .filter_map(|sb| {
                let tag = state.record_tags.get(&sb.id)?;
                Some((sb.clone(), tag.clone()))
            })
            .collect();

        LedgerSnapshot {
            sub_blocks,
            blocks: state.blocks.values().cloned().collect(),
            open_block: state.open_block,
            next_block: state.next_block,
            finalization_tags: state
                .finalization_tags
                .iter()
                .map(|(target, tag)| (*target, *tag))
                .collect(),
            distributions: state.distributions.values().cloned().collect(),
            refunds: state.refunds.values().cloned().collect(),
            pending_refunds: state.pending_refunds.values().cloned().collect(),
            actual_fees: state.actual_fees.iter().map(|(tx, fee)| (*tx, *fee)).collect(),
            settled: state.settled.iter().copied().collect(),
        }
    }

    /// Replace the ledger contents with a snapshot
    pub fn restore(&self, snapshot: LedgerSnapshot) {
        let mut restored = LedgerState {
            open_block: snapshot.open_block,
            next_block: snapshot.next_block.max(BlockId(1)),
            ..LedgerState::default()
        };

        for (sub_block, tag) in snapshot.sub_blocks {
            for tx in &sub_block.transactions {
                restored.tx_index.insert(tx.id, sub_block.id);
            }
            restored.record_tags.insert(sub_block.id, tag);
            restored.sub_blocks.insert(sub_block.id, sub_block);
        }
        restored.blocks = snapshot.blocks.into_iter().map(|b| (b.id, b)).collect();
        restored.finalization_tags = snapshot.finalization_tags.into_iter().collect();
        restored.distributions = snapshot
            .distributions
            .into_iter()
            .map(|d| (d.sub_block, d))
            .collect();
        restored.pending_refunds = snapshot
            .pending_refunds
            .into_iter()
            .map(|tx| (tx.id, tx))
            .collect();
        restored.actual_fees = snapshot.actual_fees.into_iter().collect();
        restored.refunds = snapshot
            .refunds
            .into_iter()
            .map(|r| ((r.tx, r.kind), r))
            .collect();
        restored.settled = snapshot.settled.into_iter().collect();

        *self.state.write() = restored;
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record_sub_block(&self, sub_block: &SubBlock, tag: &Sealed) -> Result<(), LedgerError> {
        if !sub_block.validated {
            return Err(LedgerError::Rejected(format!(
                "{} has not been validated",
                sub_block.id
            )));
        }

        let mut state = self.state.write();
        if let Some(existing) = state.sub_blocks.get(&sub_block.id) {
            if sub_block_digest(existing) == sub_block_digest(sub_block) {
                return Ok(());
            }
            return Err(LedgerError::ConflictingSubBlock(sub_block.id));
        }

        for tx in &sub_block.transactions {
            state.tx_index.insert(tx.id, sub_block.id);
        }
        state.record_tags.insert(sub_block.id, tag.clone());
        state.sub_blocks.insert(sub_block.id, sub_block.clone());
        Ok(())
    }

    async fn validated_sub_blocks(&self) -> Result<Vec<SubBlock>, LedgerError> {
        Ok(self
            .state
            .read()
            .sub_blocks
            .values()
            .filter(|sb| sb.validated && !sb.finalized)
            .cloned()
            .collect())
    }

    async fn validated_blocks(&self) -> Result<Vec<Block>, LedgerError> {
        let state = self.state.read();
        Ok(state
            .blocks
            .values()
            .filter(|block| block.validated && !block.finalized)
            .filter(|block| {
                block.sub_blocks.iter().all(|id| {
                    state
                        .sub_blocks
                        .get(id)
                        .map(|sb| sb.finalized)
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect())
    }

    async fn finalize(&self, target: FinalizeTarget, tag: FinalizationTag) -> Result<(), LedgerError> {
        let mut state = self.state.write();

        match target {
            FinalizeTarget::SubBlock(id) => {
                let sub_block = state
                    .sub_blocks
                    .get(&id)
                    .ok_or(LedgerError::UnknownSubBlock(id))?;
                if sub_block.finalized {
                    return Ok(());
                }
                if !sub_block.validated {
                    return Err(LedgerError::NotEligible(target));
                }

                let block_id = state.attach_to_open_block(id, self.sub_blocks_per_block);
                if let Some(sub_block) = state.sub_blocks.get_mut(&id) {
                    sub_block.finalized = true;
                    sub_block.parent_block = Some(block_id);
                }
            }
            FinalizeTarget::Block(id) => {
                let block = state.blocks.get(&id).ok_or(LedgerError::UnknownBlock(id))?;
                if block.finalized {
                    return Ok(());
                }
                let members_final = block.sub_blocks.iter().all(|member| {
                    state
                        .sub_blocks
                        .get(member)
                        .map(|sb| sb.finalized)
                        .unwrap_or(false)
                });
                if !block.validated || !members_final {
                    return Err(LedgerError::NotEligible(target));
                }
                if let Some(block) = state.blocks.get_mut(&id) {
                    block.finalized = true;
                }
            }
        }

        state.finalization_tags.insert(target, tag);
        state.finalize_calls += 1;
        Ok(())
    }

    async fn sub_blocks_pending_distribution(&self) -> Result<Vec<SubBlock>, LedgerError> {
        let state = self.state.read();
        Ok(state
            .sub_blocks
            .values()
            .filter(|sb| sb.validated && !state.distributions.contains_key(&sb.id))
            .cloned()
            .collect())
    }

    async fn distribute_rewards(&self, sub_block: SubBlockId, amount: u64) -> Result<(), LedgerError> {
        let mut state = self.state.write();
        if !state.sub_blocks.contains_key(&sub_block) {
            return Err(LedgerError::UnknownSubBlock(sub_block));
        }
        if state.distributions.contains_key(&sub_block) {
            return Ok(());
        }

        state.distributions.insert(
            sub_block,
            DistributionRecord {
                sub_block,
                amount,
                at: chrono::Utc::now().timestamp_millis(),
            },
        );
        state.distribute_calls += 1;
        Ok(())
    }

    async fn completed_pending_refund(&self) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.completed_transactions_pending())
    }

    async fn actual_fee(&self, tx: TxId) -> Result<u64, LedgerError> {
        self.state
            .read()
            .actual_fees
            .get(&tx)
            .copied()
            .ok_or(LedgerError::UnknownTransaction(tx))
    }

    async fn record_gas_refund(&self, tx: TxId, amount: &Sealed) -> Result<(), LedgerError> {
        self.record_refund(tx, RefundKind::Gas, amount)
    }

    async fn record_fee_refund(&self, tx: TxId, amount: &Sealed) -> Result<(), LedgerError> {
        self.record_refund(tx, RefundKind::Fee, amount)
    }

    async fn mark_refund_settled(&self, tx: TxId) -> Result<(), LedgerError> {
        let mut state = self.state.write();
        if state.pending_refunds.remove(&tx).is_some() {
            state.settled.insert(tx);
        }
        Ok(())
    }
}

impl MemoryLedger {
    fn record_refund(&self, tx: TxId, kind: RefundKind, amount: &Sealed) -> Result<(), LedgerError> {
        let mut state = self.state.write();
        if !state.actual_fees.contains_key(&tx) {
            return Err(LedgerError::UnknownTransaction(tx));
        }
        state.refunds.entry((tx, kind)).or_insert_with(|| RefundRecord {
            tx,
            kind,
            amount: amount.clone(),
            at: chrono::Utc::now().timestamp_millis(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::sub_block_tag;

    fn validated(id: u64, txs: u64) -> SubBlock {
        let transactions = (0..txs)
            .map(|i| Transaction::new(TxId(id * 100 + i), 10_000, 10, 100, 1))
            .collect();
        let mut sub_block = SubBlock::new(SubBlockId(id), transactions);
        sub_block.validated = true;
        sub_block
    }

    fn tag() -> Sealed {
        Sealed {
            nonce: [0u8; 24],
            ciphertext: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_record_is_idempotent_and_detects_conflicts() {
        let ledger = MemoryLedger::new(4);
        let sub_block = validated(1, 3);
        ledger.record_sub_block(&sub_block, &tag()).await.unwrap();
        ledger.record_sub_block(&sub_block, &tag()).await.unwrap();
        assert_eq!(ledger.stats().sub_blocks, 1);

        let mut changed = sub_block.clone();
        changed.transactions[0].fee = 99;
        assert_eq!(
            ledger.record_sub_block(&changed, &tag()).await,
            Err(LedgerError::ConflictingSubBlock(SubBlockId(1)))
        );

        let unvalidated = SubBlock::new(SubBlockId(2), Vec::new());
        assert!(matches!(
            ledger.record_sub_block(&unvalidated, &tag()).await,
            Err(LedgerError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_blocks_close_when_full() {
        let ledger = MemoryLedger::new(2);
        for id in 1..=3 {
            let sub_block = validated(id, 1);
            ledger.record_sub_block(&sub_block, &tag()).await.unwrap();
            ledger
                .finalize(FinalizeTarget::SubBlock(sub_block.id), sub_block_tag(&sub_block))
                .await
                .unwrap();
        }

        let ready = ledger.validated_blocks().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].sub_blocks, vec![SubBlockId(1), SubBlockId(2)]);
        assert_eq!(ledger.sub_block(SubBlockId(3)).unwrap().parent_block, Some(BlockId(2)));

        assert_eq!(ledger.seal_open_block(), Some(BlockId(2)));
        assert_eq!(ledger.validated_blocks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_finalize_rules() {
        let ledger = MemoryLedger::new(2);
        let t = FinalizationTag([7u8; 32]);
        assert_eq!(
            ledger.finalize(FinalizeTarget::Block(BlockId(9)), t).await,
            Err(LedgerError::UnknownBlock(BlockId(9)))
        );

        let sub_block = validated(1, 1);
        ledger.record_sub_block(&sub_block, &tag()).await.unwrap();
        ledger.finalize(FinalizeTarget::SubBlock(SubBlockId(1)), t).await.unwrap();
        ledger.finalize(FinalizeTarget::SubBlock(SubBlockId(1)), t).await.unwrap();
        assert_eq!(ledger.stats().finalize_calls, 1);

        // Open block is not validated yet
        assert_eq!(
            ledger.finalize(FinalizeTarget::Block(BlockId(1)), t).await,
            Err(LedgerError::NotEligible(FinalizeTarget::Block(BlockId(1))))
        );
    }

    #[tokio::test]
    async fn test_completion_and_refund_records() {
        let ledger = MemoryLedger::new(2);
        let sub_block = validated(1, 2);
        ledger.record_sub_block(&sub_block, &tag()).await.unwrap();

        assert!(ledger.complete_transaction(TxId(999), 1, 1).is_err());
        let tx = ledger.complete_transaction(TxId(100), 40, 8).unwrap();
        assert!(tx.completed && tx.receipt_generated);
        assert_eq!(ledger.actual_fee(TxId(100)).await.unwrap(), 8);

        ledger.record_gas_refund(TxId(100), &tag()).await.unwrap();
        ledger.record_gas_refund(TxId(100), &tag()).await.unwrap();
        assert_eq!(ledger.refunds().len(), 1);
        assert_eq!(
            ledger.record_fee_refund(TxId(101), &tag()).await,
            Err(LedgerError::UnknownTransaction(TxId(101)))
        );

        ledger.mark_refund_settled(TxId(100)).await.unwrap();
        assert!(ledger.completed_pending_refund().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transactions_complete_once() {
        let ledger = MemoryLedger::new(2);
        let sub_block = validated(1, 1);
        ledger.record_sub_block(&sub_block, &tag()).await.unwrap();

        ledger.complete_transaction(TxId(100), 100, 10).unwrap();
        assert!(ledger.is_completed(TxId(100)));
        assert!(matches!(
            ledger.complete_transaction(TxId(100), 40, 8),
            Err(LedgerError::Rejected(_))
        ));
        assert_eq!(ledger.actual_fee(TxId(100)).await.unwrap(), 10);

        ledger.mark_refund_settled(TxId(100)).await.unwrap();
        assert_eq!(ledger.stats().settled, 1);
        assert!(matches!(
            ledger.complete_transaction(TxId(100), 40, 8),
            Err(LedgerError::Rejected(_))
        ));
        assert!(ledger.completed_pending_refund().await.unwrap().is_empty());

        // Settled state survives a snapshot round trip
        let restored = MemoryLedger::new(2);
        restored.restore(ledger.snapshot());
        assert!(restored.is_completed(TxId(100)));
        assert!(restored.complete_transaction(TxId(100), 40, 8).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let ledger = MemoryLedger::new(2);
        let sub_block = validated(5, 2);
        ledger.record_sub_block(&sub_block, &tag()).await.unwrap();
        ledger
            .finalize(FinalizeTarget::SubBlock(SubBlockId(5)), sub_block_tag(&sub_block))
            .await
            .unwrap();
        ledger.distribute_rewards(SubBlockId(5), 20).await.unwrap();
        ledger.complete_transaction(TxId(500), 50, 9).unwrap();

        let restored = MemoryLedger::new(2);
        restored.restore(ledger.snapshot());

        assert_eq!(restored.sub_block(SubBlockId(5)), ledger.sub_block(SubBlockId(5)));
        assert_eq!(restored.next_sub_block_id(), SubBlockId(6));
        assert_eq!(restored.distributions().len(), 1);
        assert_eq!(restored.completed_transactions_pending().len(), 1);
        assert!(restored.sub_blocks_pending_distribution().await.unwrap().is_empty());

        // Open block survives; the next finalized sub-block joins it
        let next = validated(6, 1);
        restored.record_sub_block(&next, &tag()).await.unwrap();
        restored
            .finalize(FinalizeTarget::SubBlock(SubBlockId(6)), sub_block_tag(&next))
            .await
            .unwrap();
        assert_eq!(restored.block(BlockId(1)).unwrap().sub_blocks.len(), 2);
    }
}
