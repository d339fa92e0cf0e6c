//! Fee Pipeline - adaptive transaction admission, batching and settlement
//!
//! This crate provides the core stages between submission and settlement:
//! - Load-driven fee bounds and fee enforcement at admission
//! - Adaptive batching of admitted transactions into validated sub-blocks
//! - Two-tier finalization (sub-blocks, then blocks)
//! - Exactly-once fee distribution and refund reconciliation
//! - An in-memory reference ledger with sled persistence

pub mod batch_sizer;
pub mod config;
pub mod distributor;
pub mod error;
pub mod events;
pub mod fee_enforcer;
pub mod fee_policy;
pub mod finalization;
pub mod ledger;
pub mod load;
pub mod pipeline;
pub mod pool;
pub mod pool_batcher;
pub mod ports;
pub mod refund;
pub mod scheduler;
pub mod sealer;
pub mod tags;


pub use batch_sizer::BatchSizer;
pub use config::{BatchConfig, FeeConfig, PipelineConfig};
pub use distributor::{DistributionSummary, FeeDistributor};
pub use error::{ConsensusError, LedgerError, PipelineError, Result, SealError};
pub use events::{EventBus, PipelineEvent};
pub use fee_enforcer::{enforce_fee, EnforcementSummary, FeeEnforcer};
pub use fee_policy::{FeePolicy, FeePolicyAdjuster, FeeSchedule};
pub use finalization::{FinalizationCascade, FinalizationLoop, FinalizationSummary, Tier};
pub use ledger::{LedgerPersistence, MemoryLedger, PersistentStore};
pub use load::{FixedLoad, PoolLoadMonitor};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineRound};
pub use pool::{TransactionPool, TransactionSender};
pub use pool_batcher::{BatchOutcome, BatcherOptions, PoolBatcher};
pub use ports::{
    seal_amount, ConsensusValidator, EncryptionService, FeeManager, Ledger, LoadMonitor,
    TransactionSource,
};
pub use refund::{RefundReconciler, RefundSummary};
pub use scheduler::{CycleOutcome, CycleReport, PeriodicTask, Scheduler};
pub use sealer::FeeSealer;
