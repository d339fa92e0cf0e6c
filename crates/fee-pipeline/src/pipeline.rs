//! Pipeline assembly
//!
//! Wires the pool, fee governance, batching, finalization and settlement
//! stages around shared collaborators. Stages can be driven by the
//! scheduler (`start`) or stepped in order (`run_once`).

use crate::batch_sizer::BatchSizer;
use crate::config::{BatchConfig, PipelineConfig};
use crate::distributor::{DistributionSummary, FeeDistributor};
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::fee_enforcer::{EnforcementSummary, FeeEnforcer};
use crate::fee_policy::{FeePolicy, FeePolicyAdjuster, FeeSchedule};
use crate::finalization::{FinalizationCascade, FinalizationLoop, FinalizationSummary, Tier};
use crate::load::PoolLoadMonitor;
use crate::pool::{TransactionPool, TransactionSender};
use crate::pool_batcher::{BatchOutcome, BatcherOptions, PoolBatcher};
use crate::ports::{ConsensusValidator, EncryptionService, FeeManager, Ledger, LoadMonitor};
use crate::refund::{RefundReconciler, RefundSummary};
use crate::scheduler::{CycleOutcome, Scheduler};
use crate::sealer::FeeSealer;
use pipeline_types::{FeeBounds, SubBlockId};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Results of one pass through every stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRound {
    pub bounds: FeeBounds,
    pub enforcement: EnforcementSummary,
    pub batch: BatchOutcome,
    pub sub_blocks: FinalizationSummary,
    pub blocks: FinalizationSummary,
    pub distribution: DistributionSummary,
    pub refunds: RefundSummary,
}

/// Builder for Pipeline
pub struct PipelineBuilder {
    config: PipelineConfig,
    ledger: Option<Arc<dyn Ledger>>,
    validator: Option<Arc<dyn ConsensusValidator>>,
    sealer: Option<Arc<dyn EncryptionService>>,
    load_monitor: Option<Arc<dyn LoadMonitor>>,
    first_sub_block_id: SubBlockId,
    event_capacity: usize,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            ledger: None,
            validator: None,
            sealer: None,
            load_monitor: None,
            first_sub_block_id: SubBlockId(1),
            event_capacity: 1024,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn ConsensusValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Defaults to a `FeeSealer` with a random key
    pub fn sealer(mut self, sealer: Arc<dyn EncryptionService>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    /// Defaults to pool occupancy
    pub fn load_monitor(mut self, load_monitor: Arc<dyn LoadMonitor>) -> Self {
        self.load_monitor = Some(load_monitor);
        self
    }

    /// Continue sub-block numbering after a restart
    pub fn first_sub_block_id(mut self, id: SubBlockId) -> Self {
        self.first_sub_block_id = id;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let ledger = self
            .ledger
            .ok_or_else(|| PipelineError::Config("a ledger is required".into()))?;
        let validator = self
            .validator
            .ok_or_else(|| PipelineError::Config("a consensus validator is required".into()))?;
        let sealer: Arc<dyn EncryptionService> = match self.sealer {
            Some(sealer) => sealer,
            None => Arc::new(FeeSealer::generate()),
        };

        let config = self.config;
        let events = EventBus::new(self.event_capacity);
        let pool = Arc::new(TransactionPool::new(
            config.pool_capacity,
            config.intake_capacity,
        ));
        let load: Arc<dyn LoadMonitor> = match self.load_monitor {
            Some(load) => load,
            None => Arc::new(PoolLoadMonitor::new(pool.clone())),
        };

        let policy = FeePolicy::new(&config.fee);
        let fees = Arc::new(FeeSchedule::new(&policy));
        let adjuster = Arc::new(FeePolicyAdjuster::new(
            policy,
            fees.clone(),
            load.clone(),
            events.clone(),
        ));
        let enforcer = Arc::new(FeeEnforcer::new(
            pool.clone(),
            fees.clone(),
            sealer.clone(),
            events.clone(),
        ));
        let batcher = Arc::new(PoolBatcher::new(
            pool.clone(),
            BatchSizer::new(config.batch),
            load,
            validator,
            ledger.clone(),
            sealer.clone(),
            events.clone(),
            BatcherOptions {
                call_timeout: config.call_timeout(),
                requeue_on_validation_failure: config.requeue_on_validation_failure,
                first_sub_block_id: self.first_sub_block_id,
            },
        ));
        let cascade = Arc::new(FinalizationCascade::new(
            ledger.clone(),
            events.clone(),
            config.call_timeout(),
        ));
        let distributor = Arc::new(FeeDistributor::new(
            ledger.clone(),
            events.clone(),
            config.call_timeout(),
        ));
        let refunds = Arc::new(RefundReconciler::new(
            ledger,
            sealer,
            events.clone(),
            config.call_timeout(),
        ));

        tracing::info!(
            "Pipeline built: batch {}..={} (start {}), fixed ceiling {}ppm, base floor {}",
            config.batch.min_size,
            config.batch.max_size,
            config.batch.initial_size(),
            config.fee.fixed_ceiling_ppm,
            config.fee.base_floor
        );

        Ok(Pipeline {
            config,
            events,
            pool,
            fees,
            adjuster,
            enforcer,
            batcher,
            cascade,
            distributor,
            refunds,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled admission, batching and settlement pipeline
pub struct Pipeline {
    config: PipelineConfig,
    events: EventBus,
    pool: Arc<TransactionPool>,
    fees: Arc<FeeSchedule>,
    adjuster: Arc<FeePolicyAdjuster>,
    enforcer: Arc<FeeEnforcer>,
    batcher: Arc<PoolBatcher>,
    cascade: Arc<FinalizationCascade>,
    distributor: Arc<FeeDistributor>,
    refunds: Arc<RefundReconciler>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle for submitting transactions
    pub fn transaction_sender(&self) -> TransactionSender {
        self.pool.transaction_sender()
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }

    pub fn fee_bounds(&self) -> FeeBounds {
        self.fees.bounds()
    }

    /// Batch bounds in effect after normalization
    pub fn batch_config(&self) -> &BatchConfig {
        self.batcher.batch_config()
    }

    pub fn batch_target(&self) -> usize {
        self.batcher.target_size()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Spawn every stage on its configured interval
    pub fn start(&self, outcome_capacity: usize) -> (Scheduler, mpsc::Receiver<CycleOutcome>) {
        let (mut scheduler, outcomes) = Scheduler::new(outcome_capacity);
        let config = &self.config;

        scheduler.spawn(self.adjuster.clone(), config.policy_interval());
        scheduler.spawn(self.enforcer.clone(), config.enforcement_interval());
        scheduler.spawn(self.batcher.clone(), config.batch_interval());
        scheduler.spawn(
            Arc::new(FinalizationLoop::new(self.cascade.clone(), Tier::SubBlocks)),
            config.finalization_interval(),
        );
        scheduler.spawn(
            Arc::new(FinalizationLoop::new(self.cascade.clone(), Tier::Blocks)),
            config.finalization_interval(),
        );
        scheduler.spawn(self.distributor.clone(), config.distribution_interval());
        scheduler.spawn(self.refunds.clone(), config.refund_interval());

        tracing::info!("Pipeline started with {} tasks", scheduler.task_count());
        (scheduler, outcomes)
    }

    /// Run each stage once, in pipeline order
    pub async fn run_once(&self) -> Result<PipelineRound> {
        let bounds = self.adjuster.adjust_once();
        let enforcement = self.enforcer.enforce_pending();
        let batch = self.batcher.run_batch_cycle().await?;
        let sub_blocks = self.cascade.finalize_sub_blocks().await?;
        let blocks = self.cascade.finalize_blocks().await?;
        let distribution = self.distributor.distribute_pending().await?;
        let refunds = self.refunds.reconcile_pending().await?;

        Ok(PipelineRound {
            bounds,
            enforcement,
            batch,
            sub_blocks,
            blocks,
            distribution,
            refunds,
        })
    }
}
