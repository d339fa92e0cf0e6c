//! Load-adaptive batch sizing

use crate::config::BatchConfig;
use pipeline_types::NetworkLoad;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Below this load the batch grows
pub const GROW_BELOW_BPS: u16 = 5_000;

/// Above this load the batch shrinks
pub const SHRINK_ABOVE_BPS: u16 = 8_000;

/// Next batch size for a load sample. Thresholds are fixed, so a constant
/// load walks the size to `max_size` or `min_size` and stays there.
pub fn next_size(config: &BatchConfig, load: NetworkLoad, current: usize) -> usize {
    let config = config.normalized();
    let current = current.clamp(config.min_size, config.max_size);
    if load.bps() < GROW_BELOW_BPS {
        current.saturating_add(config.step).min(config.max_size)
    } else if load.bps() > SHRINK_ABOVE_BPS {
        current.saturating_sub(config.step).max(config.min_size)
    } else {
        current
    }
}

/// Holds the current batch target
pub struct BatchSizer {
    config: BatchConfig,
    current: AtomicUsize,
}

impl BatchSizer {
    pub fn new(config: BatchConfig) -> Self {
        let config = config.normalized();
        Self {
            current: AtomicUsize::new(config.default_size),
            config,
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Feed a load sample, returning `(previous, new)` targets
    pub fn observe(&self, load: NetworkLoad) -> (usize, usize) {
        let previous = self.current();
        let next = next_size(&self.config, load, previous);
        self.current.store(next, Ordering::SeqCst);
        (previous, next)
    }
}
