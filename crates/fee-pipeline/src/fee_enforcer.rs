//! Fee enforcement and admission
//!
//! Each cycle clamps the fee of every pending transaction into the current
//! bounds, seals it, and admits it to the batching pool. Transactions that
//! cannot be sealed or admitted stay pending for the next cycle.

use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::fee_policy::apply_rate;
use crate::ports::{seal_amount, EncryptionService, FeeManager, TransactionSource};
use crate::scheduler::{CycleReport, PeriodicTask};
use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_types::{FeeBounds, Transaction};
use std::sync::Arc;

/// Clamp a transaction's fee: floor, then sub-ceiling, then fixed ceiling.
///
/// The fixed ceiling is applied last and always wins. Applying the clamp to
/// an already clamped fee leaves it unchanged.
pub fn enforce_fee(tx: &mut Transaction, bounds: &FeeBounds) -> u64 {
    let mut fee = tx.fee.max(bounds.floor);
    fee = fee.min(apply_rate(tx.amount, bounds.sub_ceiling_ppm));
    fee = fee.min(apply_rate(tx.amount, bounds.fixed_ceiling_ppm));
    tx.fee = fee;
    fee
}

/// Outcome of one enforcement cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnforcementSummary {
    pub admitted: usize,
    pub deferred: usize,
}

pub struct FeeEnforcer {
    source: Arc<dyn TransactionSource>,
    fees: Arc<dyn FeeManager>,
    sealer: Arc<dyn EncryptionService>,
    events: EventBus,
    cycle_lock: Mutex<()>,
}

impl FeeEnforcer {
    pub fn new(
        source: Arc<dyn TransactionSource>,
        fees: Arc<dyn FeeManager>,
        sealer: Arc<dyn EncryptionService>,
        events: EventBus,
    ) -> Self {
        Self {
            source,
            fees,
            sealer,
            events,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Enforce and admit every pending transaction once
    pub fn enforce_pending(&self) -> EnforcementSummary {
        let _cycle = self.cycle_lock.lock();
        let bounds = self.fees.bounds();
        let mut summary = EnforcementSummary::default();

        for tx in self.source.list_pending() {
            let id = tx.id;
            match self.enforce_one(tx, &bounds) {
                Ok(fee) => {
                    summary.admitted += 1;
                    self.events
                        .publish(PipelineEvent::TransactionAdmitted { tx: id, fee });
                }
                Err(e) => {
                    summary.deferred += 1;
                    tracing::warn!("Admission of {} deferred: {}", id, e);
                    self.events.publish(PipelineEvent::AdmissionDeferred {
                        tx: id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if summary.admitted > 0 {
            tracing::debug!(
                "Admitted {} transactions (floor {}, sub-ceiling {}ppm)",
                summary.admitted,
                bounds.floor,
                bounds.sub_ceiling_ppm
            );
        }
        summary
    }

    fn enforce_one(&self, mut tx: Transaction, bounds: &FeeBounds) -> Result<u64, PipelineError> {
        // A source may list transactions that were enforced before; never clamp twice
        if !tx.is_fee_enforced() {
            let original = tx.fee;
            let fee = enforce_fee(&mut tx, bounds);
            if fee != original {
                tracing::trace!("Clamped fee of {}: {} -> {}", tx.id, original, fee);
            }
            tx.fee_sealed = Some(seal_amount(self.sealer.as_ref(), fee)?);
        }
        let fee = tx.fee;
        self.source.admit(tx)?;
        Ok(fee)
    }
}

#[async_trait]
impl PeriodicTask for FeeEnforcer {
    fn name(&self) -> &'static str {
        "fee-enforcer"
    }

    async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        let summary = self.enforce_pending();
        Ok(CycleReport::new(summary.admitted, summary.deferred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;
    use crate::fee_policy::{FeePolicy, FeeSchedule};
    use crate::pool::TransactionPool;
    use crate::sealer::FeeSealer;
    use crate::tests::mocks::BrokenSealer;
    use pipeline_types::TxId;

    fn bounds(floor: u64, sub_ceiling_ppm: u64, fixed_ceiling_ppm: u64) -> FeeBounds {
        FeeBounds {
            floor,
            sub_ceiling_ppm,
            fixed_ceiling_ppm,
        }
    }

    fn clamp(fee: u64, amount: u64, bounds: &FeeBounds) -> u64 {
        let mut tx = Transaction::new(TxId(1), amount, fee, 0, 0);
        enforce_fee(&mut tx, bounds)
    }

    #[test]
    fn test_clamp_order() {
        let b = bounds(50, 2_000, 2_500);
        // Below floor
        assert_eq!(clamp(1, 1_000_000, &b), 50);
        // Above sub-ceiling (2_000 of 1_000_000)
        assert_eq!(clamp(2_200, 1_000_000, &b), 2_000);
        // Inside bounds
        assert_eq!(clamp(700, 1_000_000, &b), 700);
        // Fixed ceiling wins over the floor
        assert_eq!(clamp(1, 10_000, &b), 20);
    }

    #[test]
    fn test_clamp_bounds_and_idempotence() {
        let floors = [0u64, 1, 10, 250];
        let sub_ceilings = [0u64, 500, 1_250, 2_500];
        let fees = [0u64, 1, 9, 100, 2_499, 10_000, u64::MAX];
        let amounts = [0u64, 1, 4_000, 100_000, 1_000_000, 1 << 40];

        for &floor in &floors {
            for &sub in &sub_ceilings {
                let b = bounds(floor, sub, 2_500);
                for &amount in &amounts {
                    let cap = apply_rate(amount, sub).min(apply_rate(amount, 2_500));
                    for &fee in &fees {
                        let enforced = clamp(fee, amount, &b);
                        assert!(enforced <= cap);
                        if floor <= cap {
                            assert!(enforced >= floor);
                        }
                        assert_eq!(clamp(enforced, amount, &b), enforced);
                    }
                }
            }
        }
    }

    #[test]
    fn test_enforcer_admits_sealed_fees() {
        let pool = Arc::new(TransactionPool::new(100, 100));
        let policy = FeePolicy::new(&FeeConfig {
            fixed_ceiling_ppm: 2_500,
            base_floor: 10,
        });
        let schedule = Arc::new(FeeSchedule::new(&policy));
        let sealer = Arc::new(FeeSealer::generate());
        let enforcer = FeeEnforcer::new(
            pool.clone(),
            schedule,
            sealer.clone(),
            EventBus::default(),
        );

        pool.submit(Transaction::new(TxId(1), 1_000_000, 1, 100, 1)).unwrap();
        pool.submit(Transaction::new(TxId(2), 1_000_000, 9_000, 100, 1)).unwrap();

        let summary = enforcer.enforce_pending();
        assert_eq!(summary, EnforcementSummary { admitted: 2, deferred: 0 });

        let admitted = pool.drain(10);
        assert_eq!(admitted[0].fee, 10);
        assert_eq!(admitted[1].fee, 2_500);
        for tx in &admitted {
            let sealed = tx.fee_sealed.as_ref().unwrap();
            assert_eq!(sealer.open_amount(sealed).unwrap(), tx.fee);
        }

        // Nothing left to enforce
        assert_eq!(enforcer.enforce_pending(), EnforcementSummary::default());
    }

    #[test]
    fn test_sealing_failure_keeps_transaction_pending() {
        let pool = Arc::new(TransactionPool::new(100, 100));
        let policy = FeePolicy::new(&FeeConfig::default());
        let enforcer = FeeEnforcer::new(
            pool.clone(),
            Arc::new(FeeSchedule::new(&policy)),
            Arc::new(BrokenSealer),
            EventBus::default(),
        );
        pool.submit(Transaction::new(TxId(1), 1_000_000, 100, 100, 1)).unwrap();

        let summary = enforcer.enforce_pending();
        assert_eq!(summary.deferred, 1);
        assert_eq!(pool.admitted_len(), 0);
        let pending = pool.list_pending();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].fee_sealed.is_none());
    }
}
