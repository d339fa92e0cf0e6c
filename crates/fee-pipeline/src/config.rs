//! Pipeline configuration

use crate::error::{PipelineError, Result};
use pipeline_types::PERCENTAGE_PRECISION;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Batch sizing bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Starting batch size
    pub default_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Increment applied per adjustment
    pub step: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_size: 500,
            min_size: 100,
            max_size: 1_000,
            step: 100,
        }
    }
}

impl BatchConfig {
    /// Bounds a sizer can always work with: `1 <= min_size <= max_size`,
    /// a non-zero step and a default inside the bounds
    pub fn normalized(&self) -> Self {
        let min_size = self.min_size.max(1);
        let max_size = self.max_size.max(min_size);
        Self {
            default_size: self.default_size.max(min_size).min(max_size),
            min_size,
            max_size,
            step: self.step.max(1),
        }
    }

    /// Default size clamped into `[min_size, max_size]`
    pub fn initial_size(&self) -> usize {
        self.normalized().default_size
    }
}

/// Fee policy constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Absolute fee ceiling as ppm of the amount (2_500 = 0.25%)
    pub fixed_ceiling_ppm: u64,
    /// Fee floor at zero load, in minor units
    pub base_floor: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            fixed_ceiling_ppm: 2_500,
            base_floor: 10,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fee bound recomputation interval
    pub policy_interval_ms: u64,
    /// Fee enforcement / admission interval
    pub enforcement_interval_ms: u64,
    /// Sub-block batching interval
    pub batch_interval_ms: u64,
    /// Finalization poll interval (sub-blocks and blocks)
    pub finalization_interval_ms: u64,
    /// Reward distribution poll interval
    pub distribution_interval_ms: u64,
    /// Refund reconciliation poll interval
    pub refund_interval_ms: u64,
    /// Upper bound on any single collaborator call
    pub call_timeout_ms: u64,
    /// Maximum admitted transactions waiting to be batched
    pub pool_capacity: usize,
    /// Capacity of the submission channel
    pub intake_capacity: usize,
    /// Return transactions of a sub-block that failed validation to the pool head
    pub requeue_on_validation_failure: bool,
    pub batch: BatchConfig,
    pub fee: FeeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            policy_interval_ms: 100,
            enforcement_interval_ms: 50,
            batch_interval_ms: 200,
            finalization_interval_ms: 100,
            distribution_interval_ms: 500,
            refund_interval_ms: 1_000,
            call_timeout_ms: 2_000,
            pool_capacity: 10_000,
            intake_capacity: 4_096,
            requeue_on_validation_failure: true,
            batch: BatchConfig::default(),
            fee: FeeConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("policy_interval_ms", self.policy_interval_ms),
            ("enforcement_interval_ms", self.enforcement_interval_ms),
            ("batch_interval_ms", self.batch_interval_ms),
            ("finalization_interval_ms", self.finalization_interval_ms),
            ("distribution_interval_ms", self.distribution_interval_ms),
            ("refund_interval_ms", self.refund_interval_ms),
            ("call_timeout_ms", self.call_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(PipelineError::Config(format!("{} must be non-zero", name)));
        }

        if self.batch.min_size == 0 {
            return Err(PipelineError::Config("batch.min_size must be at least 1".into()));
        }
        if self.batch.min_size > self.batch.max_size {
            return Err(PipelineError::Config(format!(
                "batch.min_size ({}) exceeds batch.max_size ({})",
                self.batch.min_size, self.batch.max_size
            )));
        }
        if self.batch.step == 0 {
            return Err(PipelineError::Config("batch.step must be non-zero".into()));
        }
        if self.fee.fixed_ceiling_ppm as u128 > PERCENTAGE_PRECISION {
            return Err(PipelineError::Config(format!(
                "fee.fixed_ceiling_ppm ({}) exceeds 100%",
                self.fee.fixed_ceiling_ppm
            )));
        }
        if self.pool_capacity == 0 || self.intake_capacity == 0 {
            return Err(PipelineError::Config("pool capacities must be non-zero".into()));
        }
        Ok(())
    }

    pub fn policy_interval(&self) -> Duration {
        Duration::from_millis(self.policy_interval_ms)
    }

    pub fn enforcement_interval(&self) -> Duration {
        Duration::from_millis(self.enforcement_interval_ms)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn finalization_interval(&self) -> Duration {
        Duration::from_millis(self.finalization_interval_ms)
    }

    pub fn distribution_interval(&self) -> Duration {
        Duration::from_millis(self.distribution_interval_ms)
    }

    pub fn refund_interval(&self) -> Duration {
        Duration::from_millis(self.refund_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
