//! Core types for ordering proofs and committee selection

use borsh::{BorshDeserialize, BorshSerialize};
use pipeline_types::TxId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One link of the ordering chain
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct OrderingProof {
    /// Position in the chain, starting at 1
    pub sequence: u64,
    pub tx: TxId,
    /// Root before this transaction (for verification chain)
    pub prev_root: [u8; 32],
    /// Root after this transaction
    pub root: [u8; 32],
    /// Timestamp (unix millis)
    pub timestamp: i64,
}

impl OrderingProof {
    pub fn new(sequence: u64, tx: TxId, prev_root: [u8; 32]) -> Self {
        let mut proof = Self {
            sequence,
            tx,
            prev_root,
            root: [0u8; 32],
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        proof.root = proof.compute_hash();
        proof
    }

    /// Hash over everything except `root`
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.sequence.to_le_bytes());
        hasher.update(&self.tx.0.to_le_bytes());
        hasher.update(&self.prev_root);
        hasher.update(&self.timestamp.to_le_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Serialize for storage or transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>, borsh::io::Error> {
        borsh::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// Chain verification failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("Sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("Proof {sequence} does not extend the previous root")]
    RootMismatch { sequence: u64 },

    #[error("Proof {sequence} hash does not match its contents")]
    HashMismatch { sequence: u64 },
}

/// Configuration for the local consensus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Validators assigned to each sub-block
    pub committee_size: usize,
    /// Minimum active validators needed to form a committee
    pub quorum: usize,
    /// Proofs kept in memory for inspection
    pub retained_proofs: usize,
    /// Mixed into committee ranking
    pub selection_seed: [u8; 32],
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            committee_size: 4,
            quorum: 3,
            retained_proofs: 4_096,
            selection_seed: [0u8; 32],
        }
    }
}

/// Stats about the local consensus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsensusStats {
    pub proofs_generated: u64,
    pub proofs_rejected: u64,
    pub committees_selected: u64,
    pub quorum_failures: u64,
    /// Roster size, active or not
    pub validators: usize,
    pub active_validators: usize,
    pub last_sequence: u64,
}
