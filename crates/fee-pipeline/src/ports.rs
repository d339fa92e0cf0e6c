//! Collaborator interfaces
//!
//! The pipeline talks to the outside world only through these traits.
//! Ledger and consensus calls are async and may be slow; the pipeline bounds
//! each of them with the configured call timeout.

use crate::error::{ConsensusError, LedgerError, PipelineError, SealError};
use async_trait::async_trait;
use pipeline_types::{
    Block, FeeBounds, FinalizationTag, FinalizeTarget, NetworkLoad, Sealed, SubBlock, SubBlockId,
    Transaction, TxId, ValidatorId,
};
use std::future::Future;
use std::time::Duration;

/// Source of submitted transactions awaiting fee enforcement
pub trait TransactionSource: Send + Sync {
    /// Pending transactions in arrival order
    fn list_pending(&self) -> Vec<Transaction>;

    /// Admit a fee-enforced transaction into the batching pool.
    /// Re-admitting an already admitted transaction is a no-op.
    fn admit(&self, tx: Transaction) -> Result<(), PipelineError>;
}

/// Ledger collaborator
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record a sub-block. Recording the same sub-block twice is a no-op.
    async fn record_sub_block(&self, sub_block: &SubBlock, tag: &Sealed) -> Result<(), LedgerError>;

    /// Validated sub-blocks that are not finalized yet
    async fn validated_sub_blocks(&self) -> Result<Vec<SubBlock>, LedgerError>;

    /// Validated blocks that are not finalized yet and whose sub-blocks are all final
    async fn validated_blocks(&self) -> Result<Vec<Block>, LedgerError>;

    /// Finalize an item. Finalizing an already final item succeeds without effect.
    async fn finalize(&self, target: FinalizeTarget, tag: FinalizationTag) -> Result<(), LedgerError>;

    /// Validated sub-blocks whose fees have not been distributed
    async fn sub_blocks_pending_distribution(&self) -> Result<Vec<SubBlock>, LedgerError>;

    async fn distribute_rewards(&self, sub_block: SubBlockId, amount: u64) -> Result<(), LedgerError>;

    /// Completed transactions that have not been reconciled
    async fn completed_pending_refund(&self) -> Result<Vec<Transaction>, LedgerError>;

    /// Fee actually owed after validation
    async fn actual_fee(&self, tx: TxId) -> Result<u64, LedgerError>;

    async fn record_gas_refund(&self, tx: TxId, amount: &Sealed) -> Result<(), LedgerError>;

    async fn record_fee_refund(&self, tx: TxId, amount: &Sealed) -> Result<(), LedgerError>;

    /// Remove a transaction from the pending-refund set
    async fn mark_refund_settled(&self, tx: TxId) -> Result<(), LedgerError>;
}

/// Consensus collaborator
#[async_trait]
pub trait ConsensusValidator: Send + Sync {
    /// Produce the ordering proof for one transaction
    async fn generate_ordering_proof(&self, tx: &Transaction) -> Result<(), ConsensusError>;

    /// Validator set responsible for a sub-block
    async fn select_validators(&self, sub_block: SubBlockId) -> Result<Vec<ValidatorId>, ConsensusError>;
}

/// Shared fee bound storage
///
/// `fee_ceiling` is the dynamic sub-ceiling rate in ppm.
pub trait FeeManager: Send + Sync {
    fn fee_floor(&self) -> u64;
    fn fee_ceiling(&self) -> u64;
    fn fixed_ceiling(&self) -> u64;
    fn set_fee_floor(&self, floor: u64);
    fn set_fee_ceiling(&self, ceiling_ppm: u64);

    /// Replace floor and sub-ceiling together. Implementations with shared
    /// state should make the pair visible atomically.
    fn set_bounds(&self, bounds: FeeBounds) {
        self.set_fee_ceiling(bounds.sub_ceiling_ppm);
        self.set_fee_floor(bounds.floor);
    }

    /// Snapshot of all three bounds
    fn bounds(&self) -> FeeBounds {
        FeeBounds {
            floor: self.fee_floor(),
            sub_ceiling_ppm: self.fee_ceiling(),
            fixed_ceiling_ppm: self.fixed_ceiling(),
        }
    }
}

/// Seals values before they reach the ledger
pub trait EncryptionService: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed, SealError>;
}

/// Network load signal
pub trait LoadMonitor: Send + Sync {
    fn sample(&self) -> NetworkLoad;
}

/// Seal a minor-unit amount
pub fn seal_amount(sealer: &dyn EncryptionService, amount: u64) -> Result<Sealed, SealError> {
    sealer.encrypt(&amount.to_le_bytes())
}

/// Run a collaborator call with an upper time bound
pub(crate) async fn bounded<T, E, F>(
    limit: Duration,
    operation: &'static str,
    call: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PipelineError>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(PipelineError::Timeout {
            operation,
            after_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), PipelineError> = bounded(
            Duration::from_millis(10),
            "sleepy",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), LedgerError>(())
            },
        )
        .await;
        assert_eq!(
            result,
            Err(PipelineError::Timeout {
                operation: "sleepy",
                after_ms: 10
            })
        );
    }

    #[tokio::test]
    async fn test_bounded_maps_errors() {
        let result: Result<(), PipelineError> = bounded(Duration::from_secs(1), "ledger", async {
            Err(LedgerError::Unavailable("down".into()))
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, PipelineError::Ledger(_)));
    }
}
