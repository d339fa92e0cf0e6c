//! Synthetic traffic for running the node standalone
//!
//! Submits randomized transactions at a fixed rate and marks finalized
//! transactions as executed with random gas usage and settled fees, so the
//! refund path sees work.

use crate::config::SimulationConfig;
use fee_pipeline::{MemoryLedger, PipelineError, TransactionSender};
use pipeline_types::{Transaction, TxId};
use rand::Rng;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Highest transaction id already in the ledger
pub fn last_tx_id(ledger: &MemoryLedger) -> TxId {
    ledger
        .sub_blocks()
        .iter()
        .flat_map(|sb| sb.transactions.iter().map(|tx| tx.id))
        .max()
        .unwrap_or_default()
}

fn random_transaction(id: TxId, config: &SimulationConfig) -> Transaction {
    let mut rng = rand::thread_rng();
    let amount = rng.gen_range(config.min_amount..=config.max_amount);
    // Offered fees land below, inside and above the usual bounds
    let fee = rng.gen_range(0..=amount / 200);
    let gas_limit = rng.gen_range(21_000..=100_000);
    let gas_price = rng.gen_range(1..=3);
    Transaction::new(id, amount, fee, gas_limit, gas_price)
}

/// Finalized transactions the ledger has not seen completed yet
fn completable(ledger: &MemoryLedger) -> Vec<Transaction> {
    ledger
        .sub_blocks()
        .into_iter()
        .filter(|sb| sb.finalized)
        .flat_map(|sb| sb.transactions)
        .filter(|tx| !ledger.is_completed(tx.id))
        .collect()
}

/// Submit transactions until `running` is cleared
pub fn spawn_submissions(
    sender: TransactionSender,
    config: SimulationConfig,
    after: TxId,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_micros(1_000_000 / config.rate_per_sec.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut next = after.next();
        let mut rejected = 0u64;

        while running.load(Ordering::SeqCst) {
            interval.tick().await;
            match sender.send(random_transaction(next, &config)) {
                Ok(()) => next = next.next(),
                Err(PipelineError::PoolFull { capacity }) => {
                    rejected += 1;
                    if rejected % 100 == 1 {
                        tracing::warn!("Submission channel full ({}), {} rejected", capacity, rejected);
                    }
                }
                Err(e) => tracing::error!("Submission failed: {}", e),
            }
        }

        tracing::info!("Simulator submitted up to {}", next);
    })
}

/// Complete finalized transactions until `running` is cleared
pub fn spawn_completions(
    ledger: Arc<MemoryLedger>,
    config: SimulationConfig,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(config.completion_interval_ms.max(1)));

        while running.load(Ordering::SeqCst) {
            interval.tick().await;

            let mut done = 0;
            for tx in completable(&ledger) {
                let (gas_used, actual_fee) = {
                    let mut rng = rand::thread_rng();
                    (
                        rng.gen_range(tx.gas_limit / 2..=tx.gas_limit),
                        rng.gen_range(tx.fee * 9 / 10..=tx.fee),
                    )
                };
                match ledger.complete_transaction(tx.id, gas_used, actual_fee) {
                    Ok(_) => done += 1,
                    Err(e) => tracing::warn!("Could not complete {}: {}", tx.id, e),
                }
            }
            if done > 0 {
                tracing::debug!("Simulator completed {} transactions", done);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fee_pipeline::Ledger;
    use pipeline_types::{FinalizationTag, FinalizeTarget, Sealed, SubBlock, SubBlockId};

    #[test]
    fn test_random_transactions_respect_ranges() {
        let config = SimulationConfig {
            min_amount: 1_000,
            max_amount: 2_000,
            ..Default::default()
        };
        for id in 1..=200 {
            let tx = random_transaction(TxId(id), &config);
            assert!((1_000..=2_000).contains(&tx.amount));
            assert!(tx.fee <= tx.amount / 200);
            assert!(!tx.is_fee_enforced());
        }
    }

    #[test]
    fn test_last_tx_id_of_empty_ledger() {
        assert_eq!(last_tx_id(&MemoryLedger::new(4)), TxId(0));
    }

    #[tokio::test]
    async fn test_settled_transactions_are_not_completed_again() {
        let ledger = MemoryLedger::new(4);
        let mut sub_block = SubBlock::new(
            SubBlockId(1),
            vec![
                Transaction::new(TxId(1), 10_000, 10, 100, 1),
                Transaction::new(TxId(2), 10_000, 10, 100, 1),
            ],
        );
        sub_block.validated = true;
        let tag = Sealed {
            nonce: [0u8; 24],
            ciphertext: vec![1],
        };
        ledger.record_sub_block(&sub_block, &tag).await.unwrap();
        ledger
            .finalize(FinalizeTarget::SubBlock(SubBlockId(1)), FinalizationTag([1u8; 32]))
            .await
            .unwrap();
        assert_eq!(completable(&ledger).len(), 2);

        ledger.complete_transaction(TxId(1), 100, 10).unwrap();
        ledger.mark_refund_settled(TxId(1)).await.unwrap();
        let remaining: Vec<TxId> = completable(&ledger).iter().map(|tx| tx.id).collect();
        assert_eq!(remaining, vec![TxId(2)]);
    }
}
