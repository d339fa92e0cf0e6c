//! Pool batcher
//!
//! One cycle: refresh the batch target from the load signal, drain up to that
//! many admitted transactions, get an ordering proof for each and a validator
//! set for the group, mark the sub-block validated and record it.
//!
//! A validation failure discards the sub-block; its transactions go back to
//! the head of the pool unless requeueing is disabled. A recording failure
//! keeps the validated sub-block aside and re-records it, under the same id,
//! at the start of the next cycle.

use crate::batch_sizer::BatchSizer;
use crate::config::BatchConfig;
use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use crate::pool::TransactionPool;
use crate::ports::{bounded, ConsensusValidator, EncryptionService, Ledger, LoadMonitor};
use crate::scheduler::{CycleReport, PeriodicTask};
use crate::tags::sub_block_digest;
use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_types::{SubBlock, SubBlockId, ValidatorId};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Batcher settings
#[derive(Debug, Clone, Copy)]
pub struct BatcherOptions {
    pub call_timeout: Duration,
    pub requeue_on_validation_failure: bool,
    /// Id given to the first sub-block this batcher creates
    pub first_sub_block_id: SubBlockId,
}

impl Default for BatcherOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(2),
            requeue_on_validation_failure: true,
            first_sub_block_id: SubBlockId(1),
        }
    }
}

/// What a batching cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Pool was empty
    Idle,
    Recorded {
        sub_block: SubBlockId,
        transactions: usize,
    },
    /// Validated but not recorded; kept for the next cycle
    RecordDeferred {
        sub_block: SubBlockId,
        reason: String,
    },
    Discarded {
        sub_block: SubBlockId,
        requeued: usize,
        reason: String,
    },
}

pub struct PoolBatcher {
    pool: Arc<TransactionPool>,
    sizer: BatchSizer,
    load: Arc<dyn LoadMonitor>,
    validator: Arc<dyn ConsensusValidator>,
    ledger: Arc<dyn Ledger>,
    sealer: Arc<dyn EncryptionService>,
    events: EventBus,
    options: BatcherOptions,
    next_id: AtomicU64,
    unrecorded: Mutex<Vec<SubBlock>>,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl PoolBatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<TransactionPool>,
        sizer: BatchSizer,
        load: Arc<dyn LoadMonitor>,
        validator: Arc<dyn ConsensusValidator>,
        ledger: Arc<dyn Ledger>,
        sealer: Arc<dyn EncryptionService>,
        events: EventBus,
        options: BatcherOptions,
    ) -> Self {
        Self {
            pool,
            sizer,
            load,
            validator,
            ledger,
            sealer,
            events,
            next_id: AtomicU64::new(options.first_sub_block_id.0),
            options,
            unrecorded: Mutex::new(Vec::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current batch target
    pub fn batch_config(&self) -> &BatchConfig {
        self.sizer.config()
    }

    pub fn target_size(&self) -> usize {
        self.sizer.current()
    }

    /// Validated sub-blocks waiting to be re-recorded
    pub fn unrecorded_len(&self) -> usize {
        self.unrecorded.lock().len()
    }

    /// Run one batching cycle
    pub async fn run_batch_cycle(&self) -> Result<BatchOutcome, PipelineError> {
        let _cycle = self.cycle_lock.lock().await;

        self.retry_unrecorded().await;

        let load = self.load.sample();
        let (previous, target) = self.sizer.observe(load);
        if previous != target {
            tracing::debug!("Batch target {} -> {} at load {}", previous, target, load);
            self.events.publish(PipelineEvent::BatchSizeChanged {
                from: previous,
                to: target,
                load,
            });
        }

        let drained = self.pool.drain(target);
        if drained.is_empty() {
            return Ok(BatchOutcome::Idle);
        }

        let id = SubBlockId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut sub_block = SubBlock::new(id, drained);
        tracing::info!("Sub-block {} created with {} transactions", id, sub_block.len());
        self.events.publish(PipelineEvent::SubBlockCreated {
            sub_block: id,
            transactions: sub_block.len(),
        });

        let validators = match self.validate(&sub_block).await {
            Ok(validators) => validators,
            Err(e) => return Ok(self.discard(sub_block, e)),
        };

        sub_block.validators = validators;
        sub_block.validated = true;
        tracing::info!(
            "Sub-block {} validated by {} validators",
            id,
            sub_block.validators.len()
        );
        self.events.publish(PipelineEvent::SubBlockValidated {
            sub_block: id,
            validators: sub_block.validators.len(),
        });

        let transactions = sub_block.len();
        match self.record(&sub_block).await {
            Ok(()) => Ok(BatchOutcome::Recorded {
                sub_block: id,
                transactions,
            }),
            Err(e) => {
                self.unrecorded.lock().push(sub_block);
                Ok(BatchOutcome::RecordDeferred {
                    sub_block: id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Ordering proof for every transaction, then the validator set.
    /// The first failure fails the whole sub-block.
    async fn validate(&self, sub_block: &SubBlock) -> Result<Vec<ValidatorId>, PipelineError> {
        let timeout = self.options.call_timeout;

        for tx in &sub_block.transactions {
            bounded(
                timeout,
                "generate_ordering_proof",
                self.validator.generate_ordering_proof(tx),
            )
            .await?;
        }

        bounded(
            timeout,
            "select_validators",
            self.validator.select_validators(sub_block.id),
        )
        .await
    }

    fn discard(&self, sub_block: SubBlock, error: PipelineError) -> BatchOutcome {
        let id = sub_block.id;
        let requeued = if self.options.requeue_on_validation_failure {
            self.pool.requeue_front(sub_block.transactions)
        } else {
            0
        };

        tracing::warn!(
            "Sub-block {} failed validation ({}), {} transactions requeued",
            id,
            error,
            requeued
        );
        self.events.publish(PipelineEvent::SubBlockDiscarded {
            sub_block: id,
            requeued,
            reason: error.to_string(),
        });

        BatchOutcome::Discarded {
            sub_block: id,
            requeued,
            reason: error.to_string(),
        }
    }

    /// One recording attempt. Sealing failure aborts the attempt without
    /// touching the ledger.
    async fn record(&self, sub_block: &SubBlock) -> Result<(), PipelineError> {
        let result = async {
            let tag = self.sealer.encrypt(&sub_block_digest(sub_block))?;
            bounded(
                self.options.call_timeout,
                "record_sub_block",
                self.ledger.record_sub_block(sub_block, &tag),
            )
            .await
        }
        .await;

        match &result {
            Ok(()) => {
                tracing::debug!("Sub-block {} recorded", sub_block.id);
                self.events.publish(PipelineEvent::SubBlockRecorded {
                    sub_block: sub_block.id,
                });
            }
            Err(e) => {
                tracing::error!("Failed to record sub-block {}: {}", sub_block.id, e);
                self.events.publish(PipelineEvent::SubBlockRecordFailed {
                    sub_block: sub_block.id,
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn retry_unrecorded(&self) {
        let waiting = std::mem::take(&mut *self.unrecorded.lock());
        if waiting.is_empty() {
            return;
        }

        tracing::info!("Re-recording {} sub-blocks", waiting.len());
        let mut still_waiting = Vec::new();
        for sub_block in waiting {
            if self.record(&sub_block).await.is_err() {
                still_waiting.push(sub_block);
            }
        }
        self.unrecorded.lock().extend(still_waiting);
    }
}

#[async_trait]
impl PeriodicTask for PoolBatcher {
    fn name(&self) -> &'static str {
        "pool-batcher"
    }

    async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        Ok(match self.run_batch_cycle().await? {
            BatchOutcome::Idle => CycleReport::default(),
            BatchOutcome::Recorded { .. } => CycleReport::new(1, 0),
            BatchOutcome::RecordDeferred { .. } | BatchOutcome::Discarded { .. } => {
                CycleReport::new(0, 1)
            }
        })
    }
}
