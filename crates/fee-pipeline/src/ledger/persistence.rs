//! Persistence layer for the in-memory ledger
//!
//! Uses sled to keep ledger contents across restarts. The node saves
//! periodically and on shutdown, and reloads on start so sub-block ids and
//! settlement records continue where they left off.

use super::memory::{LedgerSnapshot, MemoryLedger};
use pipeline_types::{
    Block, BlockId, DistributionRecord, FinalizationTag, FinalizeTarget, RefundRecord, Sealed,
    SubBlock, SubBlockId, Transaction, TxId,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sled::Db;
use std::path::Path;

/// Metadata about the stored ledger
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerMetadata {
    /// Highest recorded sub-block id
    pub last_sub_block: SubBlockId,
    /// Next block id the ledger will hand out
    pub next_block: BlockId,
    /// Block still collecting finalized sub-blocks
    pub open_block: Option<BlockId>,
    /// Last save timestamp (unix millis)
    pub last_save_ts: i64,
}

/// Persistent storage for ledger state
pub struct PersistentStore {
    db: Db,
    /// Sub-block and its sealed record tag, keyed by id
    sub_blocks: sled::Tree,
    blocks: sled::Tree,
    finalization_tags: sled::Tree,
    distributions: sled::Tree,
    refunds: sled::Tree,
    /// Completed transactions not yet reconciled, with their settled fee
    pending_refunds: sled::Tree,
    actual_fees: sled::Tree,
    settled: sled::Tree,
    metadata: sled::Tree,
}

impl PersistentStore {
    /// Open or create a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        let sub_blocks = db.open_tree("sub_blocks")?;
        let blocks = db.open_tree("blocks")?;
        let finalization_tags = db.open_tree("finalization_tags")?;
        let distributions = db.open_tree("distributions")?;
        let refunds = db.open_tree("refunds")?;
        let pending_refunds = db.open_tree("pending_refunds")?;
        let actual_fees = db.open_tree("actual_fees")?;
        let settled = db.open_tree("settled")?;
        let metadata = db.open_tree("metadata")?;

        tracing::info!("Opened ledger store at {:?}", path.as_ref());

        Ok(Self {
            db,
            sub_blocks,
            blocks,
            finalization_tags,
            distributions,
            refunds,
            pending_refunds,
            actual_fees,
            settled,
            metadata,
        })
    }

    pub fn store_sub_block(&self, sub_block: &SubBlock, tag: &Sealed) -> anyhow::Result<()> {
        let bytes = bincode::serialize(&(sub_block, tag))?;
        self.sub_blocks.insert(sub_block.id.0.to_be_bytes(), bytes)?;
        Ok(())
    }

    pub fn store_block(&self, block: &Block) -> anyhow::Result<()> {
        let bytes = bincode::serialize(block)?;
        self.blocks.insert(block.id.0.to_be_bytes(), bytes)?;
        Ok(())
    }

    pub fn store_finalization_tag(&self, target: FinalizeTarget, tag: &FinalizationTag) -> anyhow::Result<()> {
        let key = bincode::serialize(&target)?;
        self.finalization_tags.insert(key, tag.0.to_vec())?;
        Ok(())
    }

    pub fn store_distribution(&self, record: &DistributionRecord) -> anyhow::Result<()> {
        let bytes = bincode::serialize(record)?;
        self.distributions.insert(record.sub_block.0.to_be_bytes(), bytes)?;
        Ok(())
    }

    pub fn store_refund(&self, record: &RefundRecord) -> anyhow::Result<()> {
        let key = bincode::serialize(&(record.tx, record.kind))?;
        let bytes = bincode::serialize(record)?;
        self.refunds.insert(key, bytes)?;
        Ok(())
    }

    /// Replace the pending-refund set
    pub fn store_pending_refunds(&self, pending: &[Transaction], actual_fees: &[(TxId, u64)]) -> anyhow::Result<()> {
        self.pending_refunds.clear()?;
        for tx in pending {
            self.pending_refunds
                .insert(tx.id.0.to_be_bytes(), bincode::serialize(tx)?)?;
        }
        self.actual_fees.clear()?;
        for (tx, fee) in actual_fees {
            self.actual_fees.insert(tx.0.to_be_bytes(), &fee.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn store_settled(&self, tx: TxId) -> anyhow::Result<()> {
        self.settled.insert(tx.0.to_be_bytes(), Vec::<u8>::new())?;
        Ok(())
    }

    /// Save ledger metadata
    pub fn save_metadata(&self, metadata: &LedgerMetadata) -> anyhow::Result<()> {
        let bytes = bincode::serialize(metadata)?;
        self.metadata.insert("ledger", bytes)?;
        Ok(())
    }

    /// Load ledger metadata
    pub fn load_metadata(&self) -> anyhow::Result<Option<LedgerMetadata>> {
        match self.metadata.get("ledger")? {
            Some(bytes) => {
                let metadata: LedgerMetadata = bincode::deserialize(&bytes)?;
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }

    /// Read every stored entry back into a snapshot
    pub fn load_snapshot(&self) -> anyhow::Result<LedgerSnapshot> {
        let metadata = self.load_metadata()?.unwrap_or_default();

        let mut finalization_tags = Vec::new();
        for entry in self.finalization_tags.iter() {
            let (key, value) = entry?;
            let target: FinalizeTarget = bincode::deserialize(&key)?;
            let raw: [u8; 32] = value
                .as_ref()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid finalization tag length"))?;
            finalization_tags.push((target, FinalizationTag(raw)));
        }

        let mut actual_fees = Vec::new();
        for entry in self.actual_fees.iter() {
            let (key, value) = entry?;
            let id: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid transaction key length"))?;
            let fee: [u8; 8] = value
                .as_ref()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid fee length"))?;
            actual_fees.push((TxId(u64::from_be_bytes(id)), u64::from_le_bytes(fee)));
        }

        let mut settled = Vec::with_capacity(self.settled.len());
        for entry in self.settled.iter() {
            let (key, _) = entry?;
            let id: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid transaction key length"))?;
            settled.push(TxId(u64::from_be_bytes(id)));
        }

        Ok(LedgerSnapshot {
            sub_blocks: decode_all(&self.sub_blocks)?,
            blocks: decode_all(&self.blocks)?,
            open_block: metadata.open_block,
            next_block: metadata.next_block,
            finalization_tags,
            distributions: decode_all(&self.distributions)?,
            refunds: decode_all(&self.refunds)?,
            pending_refunds: decode_all(&self.pending_refunds)?,
            actual_fees,
            settled,
        })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn sub_block_count(&self) -> usize {
        self.sub_blocks.len()
    }
}

fn decode_all<T: DeserializeOwned>(tree: &sled::Tree) -> anyhow::Result<Vec<T>> {
    let mut items = Vec::with_capacity(tree.len());
    for entry in tree.iter() {
        let (_, value) = entry?;
        items.push(bincode::deserialize(&value)?);
    }
    Ok(items)
}

/// Extension trait to add persistence to the in-memory ledger
pub trait LedgerPersistence {
    /// Save all ledger contents to persistent storage
    fn save_to_disk(&self, store: &PersistentStore) -> anyhow::Result<usize>;

    /// Load ledger contents from persistent storage
    fn load_from_disk(&self, store: &PersistentStore) -> anyhow::Result<usize>;
}

impl LedgerPersistence for MemoryLedger {
    fn save_to_disk(&self, store: &PersistentStore) -> anyhow::Result<usize> {
        let snapshot = self.snapshot();
        let count = snapshot.sub_blocks.len();

        for (sub_block, tag) in &snapshot.sub_blocks {
            store.store_sub_block(sub_block, tag)?;
        }
        for block in &snapshot.blocks {
            store.store_block(block)?;
        }
        for (target, tag) in &snapshot.finalization_tags {
            store.store_finalization_tag(*target, tag)?;
        }
        for record in &snapshot.distributions {
            store.store_distribution(record)?;
        }
        for record in &snapshot.refunds {
            store.store_refund(record)?;
        }
        store.store_pending_refunds(&snapshot.pending_refunds, &snapshot.actual_fees)?;
        for tx in &snapshot.settled {
            store.store_settled(*tx)?;
        }

        store.save_metadata(&LedgerMetadata {
            last_sub_block: snapshot
                .sub_blocks
                .iter()
                .map(|(sb, _)| sb.id)
                .max()
                .unwrap_or_default(),
            next_block: snapshot.next_block,
            open_block: snapshot.open_block,
            last_save_ts: chrono::Utc::now().timestamp_millis(),
        })?;

        store.flush()?;
        tracing::info!("Saved {} sub-blocks to disk", count);

        Ok(count)
    }

    fn load_from_disk(&self, store: &PersistentStore) -> anyhow::Result<usize> {
        let snapshot = store.load_snapshot()?;
        let count = snapshot.sub_blocks.len();
        self.restore(snapshot);

        tracing::info!("Loaded {} sub-blocks from disk", count);

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Ledger;
    use crate::tags::sub_block_tag;
    use pipeline_types::RefundKind;
    use tempfile::tempdir;

    fn tag() -> Sealed {
        Sealed {
            nonce: [3u8; 24],
            ciphertext: vec![9, 9],
        }
    }

    #[test]
    fn test_metadata() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        assert_eq!(store.load_metadata().unwrap(), None);

        let metadata = LedgerMetadata {
            last_sub_block: SubBlockId(41),
            next_block: BlockId(5),
            open_block: Some(BlockId(4)),
            last_save_ts: 12345,
        };
        store.save_metadata(&metadata).unwrap();
        assert_eq!(store.load_metadata().unwrap(), Some(metadata));
    }

    #[tokio::test]
    async fn test_ledger_survives_restart() {
        let dir = tempdir().unwrap();
        let ledger = MemoryLedger::new(3);

        let mut sub_block = SubBlock::new(
            SubBlockId(7),
            vec![Transaction::new(TxId(70), 5_000, 12, 100, 2)],
        );
        sub_block.validated = true;
        ledger.record_sub_block(&sub_block, &tag()).await.unwrap();
        ledger
            .finalize(FinalizeTarget::SubBlock(SubBlockId(7)), sub_block_tag(&sub_block))
            .await
            .unwrap();
        ledger.distribute_rewards(SubBlockId(7), 12).await.unwrap();
        ledger.complete_transaction(TxId(70), 30, 10).unwrap();
        ledger.record_gas_refund(TxId(70), &tag()).await.unwrap();

        {
            let store = PersistentStore::open(dir.path()).unwrap();
            assert_eq!(ledger.save_to_disk(&store).unwrap(), 1);
        }

        let store = PersistentStore::open(dir.path()).unwrap();
        assert_eq!(store.sub_block_count(), 1);
        let reloaded = MemoryLedger::new(3);
        assert_eq!(reloaded.load_from_disk(&store).unwrap(), 1);

        assert_eq!(reloaded.snapshot().open_block, Some(BlockId(1)));
        assert!(reloaded.sub_block(SubBlockId(7)).unwrap().finalized);
        assert_eq!(reloaded.next_sub_block_id(), SubBlockId(8));
        assert_eq!(reloaded.distributions()[0].amount, 12);
        assert_eq!(reloaded.refunds()[0].kind, RefundKind::Gas);
        assert_eq!(reloaded.actual_fee(TxId(70)).await.unwrap(), 10);
        assert_eq!(store.load_metadata().unwrap().unwrap().last_sub_block, SubBlockId(7));
    }

    #[tokio::test]
    async fn test_settled_refunds_are_dropped_on_save() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        let ledger = MemoryLedger::new(3);
        ledger
            .put_completed(Transaction::new(TxId(1), 100, 5, 10, 1), 10, 5)
            .unwrap();
        ledger.save_to_disk(&store).unwrap();

        ledger.mark_refund_settled(TxId(1)).await.unwrap();
        ledger.save_to_disk(&store).unwrap();

        let reloaded = MemoryLedger::new(3);
        reloaded.load_from_disk(&store).unwrap();
        assert!(reloaded.completed_transactions_pending().is_empty());
        assert!(reloaded.is_completed(TxId(1)));
        assert!(reloaded
            .put_completed(Transaction::new(TxId(1), 100, 5, 10, 1), 10, 5)
            .is_err());
    }
}
