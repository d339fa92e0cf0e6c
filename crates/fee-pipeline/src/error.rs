//! Pipeline errors

use pipeline_types::{BlockId, FinalizeTarget, SubBlockId, TxId};
use thiserror::Error;

/// Errors reported by a ledger collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown sub-block {0}")]
    UnknownSubBlock(SubBlockId),

    #[error("Unknown block {0}")]
    UnknownBlock(BlockId),

    #[error("Unknown transaction {0}")]
    UnknownTransaction(TxId),

    #[error("Sub-block {0} already recorded with different contents")]
    ConflictingSubBlock(SubBlockId),

    #[error("{0} is not eligible for finalization")]
    NotEligible(FinalizeTarget),

    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Errors reported by the consensus collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Ordering proof rejected for {tx}: {reason}")]
    ProofRejected { tx: TxId, reason: String },

    #[error("Validator quorum unavailable: {available} of {required}")]
    NoQuorum { available: usize, required: usize },

    #[error("Consensus unavailable: {0}")]
    Unavailable(String),
}

/// Errors reported by the encryption service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Top-level pipeline error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    #[error("Transaction pool full ({capacity} transactions)")]
    PoolFull { capacity: usize },

    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Transient errors are expected to clear on a later cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Ledger(LedgerError::Unavailable(_))
                | PipelineError::Consensus(ConsensusError::Unavailable(_))
                | PipelineError::Timeout { .. }
                | PipelineError::PoolFull { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
