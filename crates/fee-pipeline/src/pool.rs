//! Transaction pool
//!
//! Submissions arrive over a bounded channel, wait in the pending set until
//! the fee enforcer admits them, then sit in the admitted FIFO until the
//! batcher drains them. The batcher is the only drainer.

use crate::error::PipelineError;
use crate::ports::TransactionSource;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use pipeline_types::{Transaction, TxId};
use std::collections::{HashSet, VecDeque};

/// Handle for submitting transactions to the pool
#[derive(Clone)]
pub struct TransactionSender {
    sender: Sender<Transaction>,
    capacity: usize,
}

impl TransactionSender {
    /// Submit a transaction for fee enforcement
    pub fn send(&self, tx: Transaction) -> Result<(), PipelineError> {
        self.sender.try_send(tx).map_err(|e| match e {
            TrySendError::Full(_) | TrySendError::Disconnected(_) => PipelineError::PoolFull {
                capacity: self.capacity,
            },
        })
    }
}

#[derive(Default)]
struct PoolState {
    pending: VecDeque<Transaction>,
    pending_ids: HashSet<TxId>,
    admitted: VecDeque<Transaction>,
    admitted_ids: HashSet<TxId>,
}

/// Pending and admitted transactions
pub struct TransactionPool {
    intake_rx: Receiver<Transaction>,
    intake_tx: Sender<Transaction>,
    intake_capacity: usize,
    state: Mutex<PoolState>,
    capacity: usize,
}

impl TransactionPool {
    /// `capacity` bounds the admitted queue, `intake_capacity` the submission channel
    pub fn new(capacity: usize, intake_capacity: usize) -> Self {
        let (intake_tx, intake_rx) = bounded(intake_capacity);
        Self {
            intake_rx,
            intake_tx,
            intake_capacity,
            state: Mutex::new(PoolState::default()),
            capacity,
        }
    }

    pub fn transaction_sender(&self) -> TransactionSender {
        TransactionSender {
            sender: self.intake_tx.clone(),
            capacity: self.intake_capacity,
        }
    }

    /// Submit directly, bypassing the channel
    pub fn submit(&self, tx: Transaction) -> Result<(), PipelineError> {
        self.transaction_sender().send(tx)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending_len(&self) -> usize {
        self.ingest();
        self.state.lock().pending.len()
    }

    pub fn admitted_len(&self) -> usize {
        self.state.lock().admitted.len()
    }

    /// Take up to `max` admitted transactions in admission order
    pub fn drain(&self, max: usize) -> Vec<Transaction> {
        let mut state = self.state.lock();
        let take = max.min(state.admitted.len());
        let drained: Vec<Transaction> = state.admitted.drain(..take).collect();
        for tx in &drained {
            state.admitted_ids.remove(&tx.id);
        }
        drained
    }

    /// Put transactions back at the head of the admitted queue, keeping their order.
    /// Capacity is not enforced so nothing is lost.
    pub fn requeue_front(&self, transactions: Vec<Transaction>) -> usize {
        let mut state = self.state.lock();
        let mut requeued = 0;
        for tx in transactions.into_iter().rev() {
            if state.admitted_ids.insert(tx.id) {
                state.admitted.push_front(tx);
                requeued += 1;
            }
        }
        requeued
    }

    /// Move everything waiting in the submission channel into the pending set
    fn ingest(&self) {
        let mut state = self.state.lock();
        while let Ok(tx) = self.intake_rx.try_recv() {
            if state.admitted_ids.contains(&tx.id) || !state.pending_ids.insert(tx.id) {
                tracing::debug!("Dropping duplicate submission {}", tx.id);
                continue;
            }
            state.pending.push_back(tx);
        }
    }
}

impl TransactionSource for TransactionPool {
    fn list_pending(&self) -> Vec<Transaction> {
        self.ingest();
        self.state.lock().pending.iter().cloned().collect()
    }

    fn admit(&self, tx: Transaction) -> Result<(), PipelineError> {
        let mut state = self.state.lock();

        if state.admitted_ids.contains(&tx.id) {
            if state.pending_ids.remove(&tx.id) {
                state.pending.retain(|pending| pending.id != tx.id);
            }
            return Ok(());
        }
        if state.admitted.len() >= self.capacity {
            return Err(PipelineError::PoolFull {
                capacity: self.capacity,
            });
        }

        if state.pending_ids.remove(&tx.id) {
            state.pending.retain(|pending| pending.id != tx.id);
        }
        state.admitted_ids.insert(tx.id);
        state.admitted.push_back(tx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: u64) -> Transaction {
        Transaction::new(TxId(id), 10_000, 25, 100, 1)
    }

    #[test]
    fn test_submit_list_admit_drain() {
        let pool = TransactionPool::new(10, 10);
        for id in 1..=3 {
            pool.submit(tx(id)).unwrap();
        }
        let pending = pool.list_pending();
        assert_eq!(pending.iter().map(|t| t.id.0).collect::<Vec<_>>(), vec![1, 2, 3]);

        for tx in pending {
            pool.admit(tx).unwrap();
        }
        assert_eq!(pool.pending_len(), 0);
        assert_eq!(pool.admitted_len(), 3);

        let drained = pool.drain(2);
        assert_eq!(drained.iter().map(|t| t.id.0).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(pool.admitted_len(), 1);
    }

    #[test]
    fn test_admit_is_idempotent() {
        let pool = TransactionPool::new(10, 10);
        pool.submit(tx(1)).unwrap();
        let pending = pool.list_pending();
        pool.admit(pending[0].clone()).unwrap();
        pool.admit(pending[0].clone()).unwrap();
        assert_eq!(pool.admitted_len(), 1);
    }

    #[test]
    fn test_duplicate_submission_dropped() {
        let pool = TransactionPool::new(10, 10);
        pool.submit(tx(1)).unwrap();
        pool.submit(tx(1)).unwrap();
        assert_eq!(pool.list_pending().len(), 1);
    }

    #[test]
    fn test_full_pool_defers_admission() {
        let pool = TransactionPool::new(1, 10);
        pool.submit(tx(1)).unwrap();
        pool.submit(tx(2)).unwrap();
        let pending = pool.list_pending();
        pool.admit(pending[0].clone()).unwrap();
        assert_eq!(
            pool.admit(pending[1].clone()),
            Err(PipelineError::PoolFull { capacity: 1 })
        );
        // Still pending for the next cycle
        assert_eq!(pool.list_pending().len(), 1);
    }

    #[test]
    fn test_intake_full() {
        let pool = TransactionPool::new(10, 1);
        pool.submit(tx(1)).unwrap();
        assert!(matches!(pool.submit(tx(2)), Err(PipelineError::PoolFull { .. })));
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let pool = TransactionPool::new(10, 10);
        for id in 1..=5 {
            pool.submit(tx(id)).unwrap();
        }
        for tx in pool.list_pending() {
            pool.admit(tx).unwrap();
        }
        let first = pool.drain(3);
        assert_eq!(pool.requeue_front(first), 3);
        let all = pool.drain(10);
        assert_eq!(
            all.iter().map(|t| t.id.0).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }
}
