//! Content digests for sub-block records and finalization tags

use pipeline_types::{Block, FinalizationTag, SubBlock};

/// Digest over a sub-block's identity, contents and validator set
pub fn sub_block_digest(sub_block: &SubBlock) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"sub-block");
    hasher.update(&sub_block.id.0.to_le_bytes());

    for tx in &sub_block.transactions {
        hasher.update(&tx.id.0.to_le_bytes());
        hasher.update(&tx.amount.to_le_bytes());
        hasher.update(&tx.fee.to_le_bytes());
    }
    for validator in &sub_block.validators {
        hasher.update(&validator.0);
    }

    *hasher.finalize().as_bytes()
}

/// Finalization tag for a sub-block
pub fn sub_block_tag(sub_block: &SubBlock) -> FinalizationTag {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"finalize");
    hasher.update(&sub_block_digest(sub_block));
    FinalizationTag(*hasher.finalize().as_bytes())
}

/// Finalization tag for a block
pub fn block_tag(block: &Block) -> FinalizationTag {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"finalize-block");
    hasher.update(&block.id.0.to_le_bytes());
    for member in &block.sub_blocks {
        hasher.update(&member.0.to_le_bytes());
    }
    FinalizationTag(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::{BlockId, SubBlockId, Transaction, TxId};

    #[test]
    fn test_digest_depends_on_contents() {
        let a = SubBlock::new(SubBlockId(1), vec![Transaction::new(TxId(1), 10, 1, 0, 0)]);
        let mut b = a.clone();
        assert_eq!(sub_block_digest(&a), sub_block_digest(&b));

        b.transactions[0].fee = 2;
        assert_ne!(sub_block_digest(&a), sub_block_digest(&b));
    }

    #[test]
    fn test_block_tag_is_stable() {
        let block = Block::new(BlockId(4), vec![SubBlockId(1), SubBlockId(2)]);
        assert_eq!(block_tag(&block), block_tag(&block.clone()));
        let reordered = Block::new(BlockId(4), vec![SubBlockId(2), SubBlockId(1)]);
        assert_ne!(block_tag(&block), block_tag(&reordered));
    }
}
