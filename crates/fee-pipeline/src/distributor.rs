//! Fee distribution
//!
//! Every validated sub-block hands its collected fees to the reward pools
//! exactly once. The ledger only reports undistributed sub-blocks; the local
//! set covers a ledger that reports one twice and is pruned to what the
//! ledger still reports.

use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::ports::{bounded, Ledger};
use crate::scheduler::{CycleReport, PeriodicTask};
use async_trait::async_trait;
use dashmap::DashSet;
use pipeline_types::{SubBlock, SubBlockId};
use std::{collections::HashSet, sync::Arc, time::Duration};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionSummary {
    pub distributed: usize,
    pub failed: usize,
    /// Sum of fees distributed this poll
    pub amount: u64,
}

pub struct FeeDistributor {
    ledger: Arc<dyn Ledger>,
    events: EventBus,
    call_timeout: Duration,
    distributed: DashSet<SubBlockId>,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl FeeDistributor {
    pub fn new(ledger: Arc<dyn Ledger>, events: EventBus, call_timeout: Duration) -> Self {
        Self {
            ledger,
            events,
            call_timeout,
            distributed: DashSet::new(),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn distribute_pending(&self) -> Result<DistributionSummary, PipelineError> {
        let _cycle = self.cycle_lock.lock().await;
        let pending = bounded(
            self.call_timeout,
            "sub_blocks_pending_distribution",
            self.ledger.sub_blocks_pending_distribution(),
        )
        .await?;

        let reported: HashSet<SubBlockId> = pending.iter().map(|sub_block| sub_block.id).collect();
        self.distributed.retain(|id| reported.contains(id));

        let mut summary = DistributionSummary::default();
        for sub_block in pending {
            if !sub_block.validated || self.distributed.contains(&sub_block.id) {
                continue;
            }

            match self.distribute(&sub_block).await {
                Ok(amount) => {
                    self.distributed.insert(sub_block.id);
                    summary.distributed += 1;
                    summary.amount = summary.amount.saturating_add(amount);
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!("Distribution for {} failed: {}", sub_block.id, e);
                    self.events.publish(PipelineEvent::DistributionFailed {
                        sub_block: sub_block.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(summary)
    }

    async fn distribute(&self, sub_block: &SubBlock) -> Result<u64, PipelineError> {
        let total = sub_block
            .total_fee()
            .ok_or(PipelineError::Overflow("sub-block fee total"))?;

        bounded(
            self.call_timeout,
            "distribute_rewards",
            self.ledger.distribute_rewards(sub_block.id, total),
        )
        .await?;

        tracing::info!(
            "Distributed {} in fees from {} ({} transactions)",
            total,
            sub_block.id,
            sub_block.len()
        );
        self.events.publish(PipelineEvent::RewardsDistributed {
            sub_block: sub_block.id,
            amount: total,
        });
        Ok(total)
    }
}

#[async_trait]
impl PeriodicTask for FeeDistributor {
    fn name(&self) -> &'static str {
        "fee-distributor"
    }

    async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        let summary = self.distribute_pending().await?;
        Ok(CycleReport::new(summary.distributed, summary.failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::tests::mocks::{record_validated, FaultyLedger};

    fn distributor(ledger: Arc<FaultyLedger>) -> FeeDistributor {
        FeeDistributor::new(ledger, EventBus::default(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_distributes_fee_sum_once() {
        let ledger = Arc::new(FaultyLedger::new(MemoryLedger::new(10)));
        let mut expected = Vec::new();
        for id in 1..=3 {
            let sub_block = record_validated(ledger.inner(), SubBlockId(id), 4).await;
            expected.push((sub_block.id, sub_block.transactions.iter().map(|tx| tx.fee).sum::<u64>()));
        }

        let distributor = distributor(ledger.clone());
        let summary = distributor.distribute_pending().await.unwrap();
        assert_eq!(summary.distributed, 3);
        assert_eq!(summary.amount, expected.iter().map(|(_, fee)| fee).sum::<u64>());

        let again = distributor.distribute_pending().await.unwrap();
        assert_eq!(again, DistributionSummary::default());

        let records = ledger.inner().distributions();
        assert_eq!(records.len(), 3);
        for (id, fee) in expected {
            let record = records.iter().find(|r| r.sub_block == id).unwrap();
            assert_eq!(record.amount, fee);
        }
        assert_eq!(ledger.inner().stats().distribute_calls, 3);
    }

    #[tokio::test]
    async fn test_stale_ledger_does_not_double_distribute() {
        let ledger = Arc::new(FaultyLedger::new(MemoryLedger::new(10)));
        record_validated(ledger.inner(), SubBlockId(1), 2).await;
        ledger.set_stale_reads(true);

        let distributor = distributor(ledger.clone());
        distributor.distribute_pending().await.unwrap();
        distributor.distribute_pending().await.unwrap();
        assert_eq!(ledger.inner().stats().distribute_calls, 1);
        assert_eq!(distributor.distributed.len(), 1);

        ledger.set_stale_reads(false);
        distributor.distribute_pending().await.unwrap();
        assert!(distributor.distributed.is_empty());
        assert_eq!(ledger.inner().stats().distribute_calls, 1);
    }

    #[tokio::test]
    async fn test_failed_distribution_retried() {
        let ledger = Arc::new(FaultyLedger::new(MemoryLedger::new(10)));
        record_validated(ledger.inner(), SubBlockId(1), 2).await;
        record_validated(ledger.inner(), SubBlockId(2), 2).await;
        ledger.fail_distribute_of(SubBlockId(1));

        let distributor = distributor(ledger.clone());
        let summary = distributor.distribute_pending().await.unwrap();
        assert_eq!((summary.distributed, summary.failed), (1, 1));

        ledger.clear_faults();
        let summary = distributor.distribute_pending().await.unwrap();
        assert_eq!((summary.distributed, summary.failed), (1, 0));
        assert_eq!(ledger.inner().distributions().len(), 2);
    }
}
