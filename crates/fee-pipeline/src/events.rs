//! Pipeline events
//!
//! Every state transition and every failure is published here in addition
//! to being logged. Publishing never blocks; without subscribers events are
//! dropped.

use pipeline_types::{FeeBounds, FinalizeTarget, NetworkLoad, RefundKind, SubBlockId, TxId};
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    FeeBoundsAdjusted {
        load: NetworkLoad,
        bounds: FeeBounds,
    },
    TransactionAdmitted {
        tx: TxId,
        fee: u64,
    },
    AdmissionDeferred {
        tx: TxId,
        reason: String,
    },
    BatchSizeChanged {
        from: usize,
        to: usize,
        load: NetworkLoad,
    },
    SubBlockCreated {
        sub_block: SubBlockId,
        transactions: usize,
    },
    SubBlockValidated {
        sub_block: SubBlockId,
        validators: usize,
    },
    SubBlockDiscarded {
        sub_block: SubBlockId,
        requeued: usize,
        reason: String,
    },
    SubBlockRecorded {
        sub_block: SubBlockId,
    },
    SubBlockRecordFailed {
        sub_block: SubBlockId,
        reason: String,
    },
    Finalized {
        target: FinalizeTarget,
    },
    FinalizationFailed {
        target: FinalizeTarget,
        reason: String,
    },
    RewardsDistributed {
        sub_block: SubBlockId,
        amount: u64,
    },
    DistributionFailed {
        sub_block: SubBlockId,
        reason: String,
    },
    RefundIssued {
        tx: TxId,
        kind: RefundKind,
        amount: u64,
    },
    RefundFailed {
        tx: TxId,
        kind: RefundKind,
        reason: String,
    },
}

/// Broadcast fan-out for pipeline events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}
