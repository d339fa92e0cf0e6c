//! Ordering sequencer - chains one proof per transaction

use crate::types::{OrderingProof, ProofError};
use parking_lot::RwLock;
use pipeline_types::TxId;
use std::collections::VecDeque;

struct ChainState {
    root: [u8; 32],
    sequence: u64,
    recent: VecDeque<OrderingProof>,
}

/// Append-only chain of ordering proofs
pub struct OrderingSequencer {
    state: RwLock<ChainState>,
    retained: usize,
}

impl OrderingSequencer {
    pub fn new(retained: usize) -> Self {
        Self {
            state: RwLock::new(ChainState {
                root: [0u8; 32],
                sequence: 0,
                recent: VecDeque::new(),
            }),
            retained,
        }
    }

    /// Extend the chain with a proof for `tx`
    pub fn append(&self, tx: TxId) -> OrderingProof {
        let mut state = self.state.write();
        let proof = OrderingProof::new(state.sequence + 1, tx, state.root);

        state.sequence = proof.sequence;
        state.root = proof.root;
        if self.retained > 0 {
            if state.recent.len() >= self.retained {
                state.recent.pop_front();
            }
            state.recent.push_back(proof.clone());
        }

        proof
    }

    /// Current chain root
    pub fn root(&self) -> [u8; 32] {
        self.state.read().root
    }

    pub fn sequence(&self) -> u64 {
        self.state.read().sequence
    }

    /// Most recent proofs, oldest first
    pub fn recent(&self) -> Vec<OrderingProof> {
        self.state.read().recent.iter().cloned().collect()
    }
}

/// Verify that `proofs` form an unbroken chain
pub fn verify_chain(proofs: &[OrderingProof]) -> Result<(), ProofError> {
    for proof in proofs {
        if proof.compute_hash() != proof.root {
            return Err(ProofError::HashMismatch {
                sequence: proof.sequence,
            });
        }
    }

    for pair in proofs.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.sequence != prev.sequence + 1 {
            return Err(ProofError::SequenceGap {
                expected: prev.sequence + 1,
                got: next.sequence,
            });
        }
        if next.prev_root != prev.root {
            return Err(ProofError::RootMismatch {
                sequence: next.sequence,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_links_and_verifies() {
        let sequencer = OrderingSequencer::new(16);
        for id in 1..=5 {
            sequencer.append(TxId(id));
        }

        let proofs = sequencer.recent();
        assert_eq!(proofs.len(), 5);
        assert_eq!(sequencer.sequence(), 5);
        assert_eq!(proofs[0].prev_root, [0u8; 32]);
        assert_eq!(sequencer.root(), proofs[4].root);
        verify_chain(&proofs).unwrap();
    }

    #[test]
    fn test_tampering_detected() {
        let sequencer = OrderingSequencer::new(16);
        for id in 1..=3 {
            sequencer.append(TxId(id));
        }

        let mut proofs = sequencer.recent();
        proofs[1].tx = TxId(99);
        assert_eq!(
            verify_chain(&proofs),
            Err(ProofError::HashMismatch { sequence: 2 })
        );

        let mut proofs = sequencer.recent();
        proofs.remove(1);
        assert_eq!(
            verify_chain(&proofs),
            Err(ProofError::SequenceGap { expected: 2, got: 3 })
        );
    }

    #[test]
    fn test_retention_is_bounded() {
        let sequencer = OrderingSequencer::new(2);
        for id in 1..=4 {
            sequencer.append(TxId(id));
        }
        let recent = sequencer.recent();
        assert_eq!(recent.iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![3, 4]);
        verify_chain(&recent).unwrap();
    }

    #[test]
    fn test_proof_bytes_round_trip() {
        let proof = OrderingProof::new(1, TxId(7), [3u8; 32]);
        let decoded = OrderingProof::from_bytes(&proof.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, proof);
    }
}
