//! Refund reconciliation
//!
//! Completed transactions are checked for unused gas and for fees charged
//! above what validation settled on. Each refund kind is recorded at most
//! once per transaction; a transaction leaves the pending set once both
//! kinds are handled, including when neither applies.

use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::ports::{bounded, seal_amount, EncryptionService, Ledger};
use crate::scheduler::{CycleReport, PeriodicTask};
use async_trait::async_trait;
use dashmap::DashSet;
use pipeline_types::{RefundKind, Transaction, TxId};
use std::{sync::Arc, time::Duration};

/// `(gas_limit - gas_used) * gas_price` when gas was left over
pub fn gas_refund(tx: &Transaction) -> Result<Option<u64>, PipelineError> {
    if tx.gas_used >= tx.gas_limit {
        return Ok(None);
    }
    let refund = (tx.gas_limit - tx.gas_used)
        .checked_mul(tx.gas_price)
        .ok_or(PipelineError::Overflow("gas refund"))?;
    Ok((refund > 0).then_some(refund))
}

/// `charged - actual` when the settled fee is lower
pub fn fee_refund(charged: u64, actual: u64) -> Option<u64> {
    (actual < charged).then(|| charged - actual)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefundSummary {
    pub gas_refunds: usize,
    pub fee_refunds: usize,
    /// Transactions fully reconciled this poll
    pub settled: usize,
    pub failed: usize,
}

pub struct RefundReconciler {
    ledger: Arc<dyn Ledger>,
    sealer: Arc<dyn EncryptionService>,
    events: EventBus,
    call_timeout: Duration,
    recorded: DashSet<(TxId, RefundKind)>,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl RefundReconciler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        sealer: Arc<dyn EncryptionService>,
        events: EventBus,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            sealer,
            events,
            call_timeout,
            recorded: DashSet::new(),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn reconcile_pending(&self) -> Result<RefundSummary, PipelineError> {
        let _cycle = self.cycle_lock.lock().await;
        let completed = bounded(
            self.call_timeout,
            "completed_pending_refund",
            self.ledger.completed_pending_refund(),
        )
        .await?;

        let mut summary = RefundSummary::default();
        for tx in completed {
            if !tx.completed {
                continue;
            }
            self.reconcile(&tx, &mut summary).await;
        }
        Ok(summary)
    }

    async fn reconcile(&self, tx: &Transaction, summary: &mut RefundSummary) {
        let mut clean = true;

        let gas = gas_refund(tx);
        match gas {
            Ok(amount) => {
                if !self.issue(tx.id, RefundKind::Gas, amount, summary).await {
                    clean = false;
                }
            }
            Err(e) => {
                clean = false;
                self.report_failure(tx.id, RefundKind::Gas, &e);
            }
        }

        let actual = bounded(self.call_timeout, "actual_fee", self.ledger.actual_fee(tx.id)).await;
        match actual {
            Ok(actual) => {
                let amount = fee_refund(tx.fee, actual);
                if !self.issue(tx.id, RefundKind::Fee, amount, summary).await {
                    clean = false;
                }
            }
            Err(e) => {
                clean = false;
                self.report_failure(tx.id, RefundKind::Fee, &e);
            }
        }

        if !clean {
            summary.failed += 1;
            return;
        }

        match bounded(
            self.call_timeout,
            "mark_refund_settled",
            self.ledger.mark_refund_settled(tx.id),
        )
        .await
        {
            Ok(()) => {
                self.recorded.remove(&(tx.id, RefundKind::Gas));
                self.recorded.remove(&(tx.id, RefundKind::Fee));
                summary.settled += 1;
            }
            Err(e) => {
                summary.failed += 1;
                tracing::warn!("Could not settle refunds for {}: {}", tx.id, e);
            }
        }
    }

    /// Record one refund kind. Returns false when the refund is still owed.
    async fn issue(
        &self,
        tx: TxId,
        kind: RefundKind,
        amount: Option<u64>,
        summary: &mut RefundSummary,
    ) -> bool {
        let Some(amount) = amount else {
            return true;
        };
        if self.recorded.contains(&(tx, kind)) {
            return true;
        }

        let result = async {
            let sealed = seal_amount(self.sealer.as_ref(), amount)?;
            match kind {
                RefundKind::Gas => {
                    bounded(
                        self.call_timeout,
                        "record_gas_refund",
                        self.ledger.record_gas_refund(tx, &sealed),
                    )
                    .await
                }
                RefundKind::Fee => {
                    bounded(
                        self.call_timeout,
                        "record_fee_refund",
                        self.ledger.record_fee_refund(tx, &sealed),
                    )
                    .await
                }
            }
        }
        .await;

        match result {
            Ok(()) => {
                self.recorded.insert((tx, kind));
                match kind {
                    RefundKind::Gas => summary.gas_refunds += 1,
                    RefundKind::Fee => summary.fee_refunds += 1,
                }
                tracing::info!("Refunded {} {} to {}", amount, kind, tx);
                self.events
                    .publish(PipelineEvent::RefundIssued { tx, kind, amount });
                true
            }
            Err(e) => {
                self.report_failure(tx, kind, &e);
                false
            }
        }
    }

    fn report_failure(&self, tx: TxId, kind: RefundKind, error: &PipelineError) {
        tracing::warn!("{} refund for {} failed: {}", kind, tx, error);
        self.events.publish(PipelineEvent::RefundFailed {
            tx,
            kind,
            reason: error.to_string(),
        });
    }
}

#[async_trait]
impl PeriodicTask for RefundReconciler {
    fn name(&self) -> &'static str {
        "refund-reconciler"
    }

    async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        let summary = self.reconcile_pending().await?;
        Ok(CycleReport::new(summary.settled, summary.failed))
    }
}
