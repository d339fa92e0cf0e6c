//! Finalization cascade
//!
//! Two independent polls against the ledger: validated sub-blocks awaiting
//! finalization, and validated blocks awaiting finalization. A failed item is
//! left for the next poll and never blocks the rest of the cycle. Targets are
//! remembered only while the ledger still reports them.

use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::ports::{bounded, Ledger};
use crate::scheduler::{CycleReport, PeriodicTask};
use crate::tags::{block_tag, sub_block_tag};
use async_trait::async_trait;
use dashmap::DashSet;
use pipeline_types::{FinalizationTag, FinalizeTarget};
use std::{collections::HashSet, sync::Arc, time::Duration};

/// Which poll a loop runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    SubBlocks,
    Blocks,
}

impl Tier {
    fn of(target: &FinalizeTarget) -> Self {
        match target {
            FinalizeTarget::SubBlock(_) => Tier::SubBlocks,
            FinalizeTarget::Block(_) => Tier::Blocks,
        }
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizationSummary {
    pub finalized: usize,
    pub failed: usize,
    /// Already finalized by this cascade earlier
    pub skipped: usize,
}

pub struct FinalizationCascade {
    ledger: Arc<dyn Ledger>,
    events: EventBus,
    call_timeout: Duration,
    finalized: DashSet<FinalizeTarget>,
    cycle_locks: [tokio::sync::Mutex<()>; 2],
}

impl FinalizationCascade {
    pub fn new(ledger: Arc<dyn Ledger>, events: EventBus, call_timeout: Duration) -> Self {
        Self {
            ledger,
            events,
            call_timeout,
            finalized: DashSet::new(),
            cycle_locks: [tokio::sync::Mutex::new(()), tokio::sync::Mutex::new(())],
        }
    }

    pub fn finalized_count(&self) -> usize {
        self.finalized.len()
    }

    pub async fn poll(&self, tier: Tier) -> Result<FinalizationSummary, PipelineError> {
        match tier {
            Tier::SubBlocks => self.finalize_sub_blocks().await,
            Tier::Blocks => self.finalize_blocks().await,
        }
    }

    pub async fn finalize_sub_blocks(&self) -> Result<FinalizationSummary, PipelineError> {
        let _cycle = self.cycle_locks[0].lock().await;
        let candidates = bounded(
            self.call_timeout,
            "validated_sub_blocks",
            self.ledger.validated_sub_blocks(),
        )
        .await?;

        let items = candidates
            .iter()
            .map(|sub_block| (FinalizeTarget::SubBlock(sub_block.id), sub_block_tag(sub_block)))
            .collect();
        Ok(self.finalize_all(Tier::SubBlocks, items).await)
    }

    pub async fn finalize_blocks(&self) -> Result<FinalizationSummary, PipelineError> {
        let _cycle = self.cycle_locks[1].lock().await;
        let candidates = bounded(
            self.call_timeout,
            "validated_blocks",
            self.ledger.validated_blocks(),
        )
        .await?;

        let items = candidates
            .iter()
            .map(|block| (FinalizeTarget::Block(block.id), block_tag(block)))
            .collect();
        Ok(self.finalize_all(Tier::Blocks, items).await)
    }

    async fn finalize_all(
        &self,
        tier: Tier,
        items: Vec<(FinalizeTarget, FinalizationTag)>,
    ) -> FinalizationSummary {
        let reported: HashSet<FinalizeTarget> = items.iter().map(|(target, _)| *target).collect();
        self.finalized
            .retain(|target| Tier::of(target) != tier || reported.contains(target));

        let mut summary = FinalizationSummary::default();
        for (target, tag) in items {
            if self.finalized.contains(&target) {
                summary.skipped += 1;
                continue;
            }

            match bounded(self.call_timeout, "finalize", self.ledger.finalize(target, tag)).await {
                Ok(()) => {
                    self.finalized.insert(target);
                    summary.finalized += 1;
                    tracing::info!("{} finalized", target);
                    self.events.publish(PipelineEvent::Finalized { target });
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!("Finalization of {} failed, retrying next poll: {}", target, e);
                    self.events.publish(PipelineEvent::FinalizationFailed {
                        target,
                        reason: e.to_string(),
                    });
                }
            }
        }

        summary
    }
}

/// One of the two finalization polls as a periodic task
pub struct FinalizationLoop {
    cascade: Arc<FinalizationCascade>,
    tier: Tier,
}

impl FinalizationLoop {
    pub fn new(cascade: Arc<FinalizationCascade>, tier: Tier) -> Self {
        Self { cascade, tier }
    }
}

#[async_trait]
impl PeriodicTask for FinalizationLoop {
    fn name(&self) -> &'static str {
        match self.tier {
            Tier::SubBlocks => "finalize-sub-blocks",
            Tier::Blocks => "finalize-blocks",
        }
    }

    async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        let summary = self.cascade.poll(self.tier).await?;
        Ok(CycleReport::new(summary.finalized, summary.failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::tests::mocks::{record_validated, FaultyLedger};
    use pipeline_types::{BlockId, SubBlockId};

    fn cascade(ledger: Arc<FaultyLedger>) -> (FinalizationCascade, tokio::sync::broadcast::Receiver<PipelineEvent>) {
        let events = EventBus::default();
        let rx = events.subscribe();
        (
            FinalizationCascade::new(ledger, events, Duration::from_millis(200)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_sub_blocks_then_blocks() {
        let ledger = Arc::new(FaultyLedger::new(MemoryLedger::new(2)));
        for id in 1..=2 {
            record_validated(ledger.inner(), SubBlockId(id), 3).await;
        }
        let (cascade, _rx) = cascade(ledger.clone());

        // Block not eligible until its sub-blocks are final
        assert_eq!(cascade.finalize_blocks().await.unwrap().finalized, 0);

        let summary = cascade.finalize_sub_blocks().await.unwrap();
        assert_eq!(summary.finalized, 2);
        let sub_block = ledger.inner().sub_block(SubBlockId(1)).unwrap();
        assert!(sub_block.finalized);
        assert_eq!(sub_block.parent_block, Some(BlockId(1)));

        let summary = cascade.finalize_blocks().await.unwrap();
        assert_eq!(summary.finalized, 1);
        assert!(ledger.inner().block(BlockId(1)).unwrap().finalized);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_others() {
        let ledger = Arc::new(FaultyLedger::new(MemoryLedger::new(10)));
        for id in 1..=3 {
            record_validated(ledger.inner(), SubBlockId(id), 1).await;
        }
        ledger.fail_finalize_of(FinalizeTarget::SubBlock(SubBlockId(2)));
        let (cascade, _rx) = cascade(ledger.clone());

        let summary = cascade.finalize_sub_blocks().await.unwrap();
        assert_eq!(summary, FinalizationSummary { finalized: 2, failed: 1, skipped: 0 });
        assert!(!ledger.inner().sub_block(SubBlockId(2)).unwrap().finalized);

        ledger.clear_faults();
        let summary = cascade.finalize_sub_blocks().await.unwrap();
        assert_eq!(summary.finalized, 1);
        assert!(ledger.inner().sub_block(SubBlockId(2)).unwrap().finalized);
    }

    #[tokio::test]
    async fn test_double_poll_finalizes_once() {
        let ledger = Arc::new(FaultyLedger::new(MemoryLedger::new(10)));
        record_validated(ledger.inner(), SubBlockId(1), 2).await;
        // Ledger keeps reporting the item even after finalizing it
        ledger.set_stale_reads(true);
        let (cascade, mut rx) = cascade(ledger.clone());

        cascade.finalize_sub_blocks().await.unwrap();
        let second = cascade.finalize_sub_blocks().await.unwrap();
        assert_eq!(second, FinalizationSummary { finalized: 0, failed: 0, skipped: 1 });

        assert_eq!(ledger.inner().stats().finalize_calls, 1);
        assert_eq!(cascade.finalized_count(), 1);
        let mut finalized_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PipelineEvent::Finalized { .. }) {
                finalized_events += 1;
            }
        }
        assert_eq!(finalized_events, 1);
    }

    #[tokio::test]
    async fn test_forgets_targets_the_ledger_stops_reporting() {
        let ledger = Arc::new(FaultyLedger::new(MemoryLedger::new(2)));
        for id in 1..=2 {
            record_validated(ledger.inner(), SubBlockId(id), 1).await;
        }
        ledger.set_stale_reads(true);
        let (cascade, _rx) = cascade(ledger.clone());

        cascade.finalize_sub_blocks().await.unwrap();
        cascade.finalize_blocks().await.unwrap();
        assert_eq!(cascade.finalized_count(), 3);

        // Sub-block poll only prunes its own tier
        ledger.set_stale_reads(false);
        cascade.finalize_sub_blocks().await.unwrap();
        assert_eq!(cascade.finalized_count(), 1);
        cascade.finalize_blocks().await.unwrap();
        assert_eq!(cascade.finalized_count(), 0);
        assert_eq!(ledger.inner().stats().finalize_calls, 3);
    }

    #[tokio::test]
    async fn test_ledger_unavailable_fails_poll() {
        let ledger = Arc::new(FaultyLedger::new(MemoryLedger::new(10)));
        ledger.set_unavailable(true);
        let (cascade, _rx) = cascade(ledger);
        let err = cascade.finalize_sub_blocks().await.unwrap_err();
        assert!(err.is_transient());
    }
}
