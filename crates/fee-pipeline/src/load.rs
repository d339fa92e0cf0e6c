//! Network load sources

use crate::pool::TransactionPool;
use crate::ports::LoadMonitor;
use pipeline_types::NetworkLoad;
use std::sync::{
    atomic::{AtomicU16, Ordering},
    Arc,
};

/// Load derived from pool occupancy
pub struct PoolLoadMonitor {
    pool: Arc<TransactionPool>,
}

impl PoolLoadMonitor {
    pub fn new(pool: Arc<TransactionPool>) -> Self {
        Self { pool }
    }
}

impl LoadMonitor for PoolLoadMonitor {
    fn sample(&self) -> NetworkLoad {
        let capacity = self.pool.capacity();
        if capacity == 0 {
            return NetworkLoad::SATURATED;
        }
        let occupied = self.pool.admitted_len() + self.pool.pending_len();
        NetworkLoad::from_ratio(occupied as f64 / capacity as f64)
    }
}

/// Operator- or test-controlled load
#[derive(Debug, Default)]
pub struct FixedLoad {
    bps: AtomicU16,
}

impl FixedLoad {
    pub fn new(load: NetworkLoad) -> Self {
        Self {
            bps: AtomicU16::new(load.bps()),
        }
    }

    pub fn set(&self, load: NetworkLoad) {
        self.bps.store(load.bps(), Ordering::SeqCst);
    }
}

impl LoadMonitor for FixedLoad {
    fn sample(&self) -> NetworkLoad {
        NetworkLoad::from_bps(self.bps.load(Ordering::SeqCst))
    }
}
