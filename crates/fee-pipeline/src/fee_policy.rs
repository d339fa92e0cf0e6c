//! Fee policy
//!
//! `FeePolicy` maps a load sample to new fee bounds. `FeeSchedule` is the
//! shared, lock-protected home of the current bounds: the adjuster writes it,
//! the enforcer reads it.

use crate::config::FeeConfig;
use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::ports::{FeeManager, LoadMonitor};
use crate::scheduler::{CycleReport, PeriodicTask};
use async_trait::async_trait;
use parking_lot::RwLock;
use pipeline_types::{FeeBounds, NetworkLoad, LOAD_PRECISION, PERCENTAGE_PRECISION};
use std::sync::Arc;

/// Apply a ppm rate to an amount, rounding down
pub fn apply_rate(amount: u64, rate_ppm: u64) -> u64 {
    let scaled = amount as u128 * rate_ppm as u128 / PERCENTAGE_PRECISION;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Pure load → bounds mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    base_floor: u64,
    fixed_ceiling_ppm: u64,
}

impl FeePolicy {
    pub fn new(config: &FeeConfig) -> Self {
        Self {
            base_floor: config.base_floor,
            fixed_ceiling_ppm: config.fixed_ceiling_ppm,
        }
    }

    pub fn fixed_ceiling_ppm(&self) -> u64 {
        self.fixed_ceiling_ppm
    }

    /// sub_ceiling = fixed * (1 - load/2), floor = base * (1 + load)
    pub fn adjust_bounds(&self, load: NetworkLoad) -> FeeBounds {
        let load = load.bps() as u128;
        let precision = LOAD_PRECISION as u128;

        let sub_ceiling =
            self.fixed_ceiling_ppm as u128 * (2 * precision - load) / (2 * precision);
        let sub_ceiling_ppm = (sub_ceiling as u64).min(self.fixed_ceiling_ppm);

        let floor = self.base_floor as u128 * (precision + load) / precision;
        let floor = u64::try_from(floor).unwrap_or(u64::MAX);

        FeeBounds {
            floor,
            sub_ceiling_ppm,
            fixed_ceiling_ppm: self.fixed_ceiling_ppm,
        }
    }
}

/// Current fee bounds shared between adjuster and enforcer
pub struct FeeSchedule {
    bounds: RwLock<FeeBounds>,
}

impl FeeSchedule {
    /// Schedule starting at the idle-load bounds
    pub fn new(policy: &FeePolicy) -> Self {
        Self {
            bounds: RwLock::new(policy.adjust_bounds(NetworkLoad::IDLE)),
        }
    }
}

impl FeeManager for FeeSchedule {
    fn fee_floor(&self) -> u64 {
        self.bounds.read().floor
    }

    fn fee_ceiling(&self) -> u64 {
        self.bounds.read().sub_ceiling_ppm
    }

    fn fixed_ceiling(&self) -> u64 {
        self.bounds.read().fixed_ceiling_ppm
    }

    fn set_fee_floor(&self, floor: u64) {
        self.bounds.write().floor = floor;
    }

    fn set_fee_ceiling(&self, ceiling_ppm: u64) {
        let mut bounds = self.bounds.write();
        bounds.sub_ceiling_ppm = ceiling_ppm.min(bounds.fixed_ceiling_ppm);
    }

    fn set_bounds(&self, bounds: FeeBounds) {
        let mut current = self.bounds.write();
        current.floor = bounds.floor;
        current.sub_ceiling_ppm = bounds.sub_ceiling_ppm.min(current.fixed_ceiling_ppm);
    }

    fn bounds(&self) -> FeeBounds {
        *self.bounds.read()
    }
}

/// Periodic task recomputing fee bounds from the load signal
pub struct FeePolicyAdjuster {
    policy: FeePolicy,
    fees: Arc<dyn FeeManager>,
    load: Arc<dyn LoadMonitor>,
    events: EventBus,
}

impl FeePolicyAdjuster {
    pub fn new(
        policy: FeePolicy,
        fees: Arc<dyn FeeManager>,
        load: Arc<dyn LoadMonitor>,
        events: EventBus,
    ) -> Self {
        Self {
            policy,
            fees,
            load,
            events,
        }
    }

    /// Sample load once and publish the resulting bounds
    pub fn adjust_once(&self) -> FeeBounds {
        let load = self.load.sample();
        let bounds = self.policy.adjust_bounds(load);
        let previous = self.fees.bounds();

        self.fees.set_bounds(bounds);

        if previous.floor != bounds.floor || previous.sub_ceiling_ppm != bounds.sub_ceiling_ppm {
            tracing::debug!(
                "Fee bounds at load {}: floor {} -> {}, sub-ceiling {}ppm -> {}ppm",
                load,
                previous.floor,
                bounds.floor,
                previous.sub_ceiling_ppm,
                bounds.sub_ceiling_ppm
            );
            self.events
                .publish(PipelineEvent::FeeBoundsAdjusted { load, bounds });
        }

        bounds
    }
}

#[async_trait]
impl PeriodicTask for FeePolicyAdjuster {
    fn name(&self) -> &'static str {
        "fee-policy"
    }

    async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        self.adjust_once();
        Ok(CycleReport::new(1, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::FixedLoad;

    fn policy() -> FeePolicy {
        FeePolicy::new(&FeeConfig {
            fixed_ceiling_ppm: 2_500,
            base_floor: 100,
        })
    }

    #[test]
    fn test_bounds_at_extremes() {
        let idle = policy().adjust_bounds(NetworkLoad::IDLE);
        assert_eq!(idle.floor, 100);
        assert_eq!(idle.sub_ceiling_ppm, 2_500);

        let full = policy().adjust_bounds(NetworkLoad::SATURATED);
        assert_eq!(full.floor, 200);
        assert_eq!(full.sub_ceiling_ppm, 1_250);

        let half = policy().adjust_bounds(NetworkLoad::from_ratio(0.5));
        assert_eq!(half.floor, 150);
        assert_eq!(half.sub_ceiling_ppm, 1_875);
    }

    #[test]
    fn test_monotonic_in_load() {
        let policy = policy();
        let mut previous = policy.adjust_bounds(NetworkLoad::IDLE);
        for bps in (0..=10_000u16).step_by(250) {
            let bounds = policy.adjust_bounds(NetworkLoad::from_bps(bps));
            assert!(bounds.floor >= previous.floor);
            assert!(bounds.sub_ceiling_ppm <= previous.sub_ceiling_ppm);
            assert!(bounds.sub_ceiling_ppm <= bounds.fixed_ceiling_ppm);
            previous = bounds;
        }
    }

    #[test]
    fn test_schedule_caps_ceiling() {
        let schedule = FeeSchedule::new(&policy());
        schedule.set_fee_ceiling(9_999);
        assert_eq!(schedule.fee_ceiling(), 2_500);
        schedule.set_fee_floor(7);
        assert_eq!(schedule.bounds().floor, 7);
    }

    #[test]
    fn test_readers_never_see_mixed_bounds() {
        let policy = policy();
        let idle = policy.adjust_bounds(NetworkLoad::IDLE);
        let full = policy.adjust_bounds(NetworkLoad::SATURATED);
        let schedule = FeeSchedule::new(&policy);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..10_000 {
                    schedule.set_bounds(if i % 2 == 0 { full } else { idle });
                }
            });
            for _ in 0..10_000 {
                let seen = schedule.bounds();
                assert!(seen == idle || seen == full, "mixed bounds {:?}", seen);
            }
        });
    }

    #[test]
    fn test_set_bounds_caps_ceiling() {
        let schedule = FeeSchedule::new(&policy());
        schedule.set_bounds(FeeBounds {
            floor: 42,
            sub_ceiling_ppm: 9_999,
            fixed_ceiling_ppm: 1,
        });
        let bounds = schedule.bounds();
        assert_eq!(bounds.floor, 42);
        assert_eq!(bounds.sub_ceiling_ppm, 2_500);
        assert_eq!(bounds.fixed_ceiling_ppm, 2_500);
    }

    #[test]
    fn test_adjuster_publishes_changes() {
        let schedule = Arc::new(FeeSchedule::new(&policy()));
        let load = Arc::new(FixedLoad::new(NetworkLoad::SATURATED));
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let adjuster = FeePolicyAdjuster::new(policy(), schedule.clone(), load.clone(), events);

        let bounds = adjuster.adjust_once();
        assert_eq!(schedule.bounds(), bounds);
        assert!(matches!(
            rx.try_recv().unwrap(),
            PipelineEvent::FeeBoundsAdjusted { .. }
        ));

        // Same load, no change, no event
        adjuster.adjust_once();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_apply_rate() {
        assert_eq!(apply_rate(1_000_000, 2_500), 2_500);
        assert_eq!(apply_rate(399, 2_500), 0);
        assert_eq!(apply_rate(u64::MAX, 1_000_000), u64::MAX);
    }
}
