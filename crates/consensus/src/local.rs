//! Local consensus - in-process ordering proofs and committee selection

use crate::committee::Roster;
use crate::sequencer::{verify_chain, OrderingSequencer};
use crate::types::{ConsensusConfig, ConsensusStats, OrderingProof, ProofError};
use async_trait::async_trait;
use fee_pipeline::{ConsensusError, ConsensusValidator};
use parking_lot::RwLock;
use pipeline_types::{SubBlockId, Transaction, ValidatorId};

/// Consensus collaborator running entirely in this process
pub struct LocalConsensus {
    sequencer: OrderingSequencer,
    roster: Roster,
    stats: RwLock<ConsensusStats>,
    config: ConsensusConfig,
}

impl LocalConsensus {
    pub fn new(config: ConsensusConfig, validators: Vec<ValidatorId>) -> Self {
        tracing::info!(
            "Local consensus with {} validators (committee {}, quorum {})",
            validators.len(),
            config.committee_size,
            config.quorum
        );
        let roster = Roster::new(validators, config.selection_seed);
        if roster.is_empty() {
            tracing::warn!("Local consensus has no validators; every selection will fail");
        }
        Self {
            sequencer: OrderingSequencer::new(config.retained_proofs),
            roster,
            stats: RwLock::new(ConsensusStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Mark a validator active or inactive
    pub fn set_active(&self, validator: ValidatorId, active: bool) {
        self.roster.set_active(validator, active);
        tracing::info!(
            "Validator {} {}",
            validator,
            if active { "activated" } else { "deactivated" }
        );
    }

    /// Retained proofs, oldest first
    pub fn recent_proofs(&self) -> Vec<OrderingProof> {
        self.sequencer.recent()
    }

    /// Verify the retained part of the ordering chain
    pub fn verify_recent(&self) -> Result<(), ProofError> {
        verify_chain(&self.sequencer.recent())
    }

    pub fn root(&self) -> [u8; 32] {
        self.sequencer.root()
    }

    /// Get current stats
    pub fn stats(&self) -> ConsensusStats {
        let mut stats = self.stats.read().clone();
        stats.validators = self.roster.len();
        stats.active_validators = self.roster.active().len();
        stats.last_sequence = self.sequencer.sequence();
        stats
    }
}

#[async_trait]
impl ConsensusValidator for LocalConsensus {
    async fn generate_ordering_proof(&self, tx: &Transaction) -> Result<(), ConsensusError> {
        if !tx.is_fee_enforced() {
            self.stats.write().proofs_rejected += 1;
            return Err(ConsensusError::ProofRejected {
                tx: tx.id,
                reason: "fee has not been enforced".into(),
            });
        }

        let proof = self.sequencer.append(tx.id);
        self.stats.write().proofs_generated += 1;
        tracing::trace!("Ordering proof {} for {}", proof.sequence, tx.id);
        Ok(())
    }

    async fn select_validators(&self, sub_block: SubBlockId) -> Result<Vec<ValidatorId>, ConsensusError> {
        match self
            .roster
            .select(sub_block, self.config.committee_size, self.config.quorum)
        {
            Ok(committee) => {
                self.stats.write().committees_selected += 1;
                tracing::debug!("{} committee: {} validators", sub_block, committee.len());
                Ok(committee)
            }
            Err(e) => {
                self.stats.write().quorum_failures += 1;
                tracing::warn!("No committee for {}: {}", sub_block, e);
                Err(e)
            }
        }
    }
}

/// Builder for LocalConsensus
pub struct LocalConsensusBuilder {
    config: ConsensusConfig,
    validators: Vec<ValidatorId>,
}

impl LocalConsensusBuilder {
    pub fn new() -> Self {
        Self {
            config: ConsensusConfig::default(),
            validators: Vec::new(),
        }
    }

    pub fn validators(mut self, validators: Vec<ValidatorId>) -> Self {
        self.validators = validators;
        self
    }

    /// Derive `count` validator ids from a label
    pub fn generated_validators(mut self, label: &str, count: usize) -> Self {
        self.validators = (0..count)
            .map(|i| {
                let mut hasher = blake3::Hasher::new();
                hasher.update(label.as_bytes());
                hasher.update(&(i as u64).to_le_bytes());
                ValidatorId(*hasher.finalize().as_bytes())
            })
            .collect();
        self
    }

    pub fn committee_size(mut self, size: usize) -> Self {
        self.config.committee_size = size;
        self
    }

    pub fn quorum(mut self, quorum: usize) -> Self {
        self.config.quorum = quorum;
        self
    }

    pub fn selection_seed(mut self, seed: [u8; 32]) -> Self {
        self.config.selection_seed = seed;
        self
    }

    pub fn retained_proofs(mut self, retained: usize) -> Self {
        self.config.retained_proofs = retained;
        self
    }

    pub fn build(self) -> LocalConsensus {
        LocalConsensus::new(self.config, self.validators)
    }
}

impl Default for LocalConsensusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::{Sealed, TxId};

    fn enforced(id: u64) -> Transaction {
        let mut tx = Transaction::new(TxId(id), 10_000, 20, 100, 1);
        tx.fee_sealed = Some(Sealed {
            nonce: [0u8; 24],
            ciphertext: vec![1],
        });
        tx
    }

    #[tokio::test]
    async fn test_proofs_chain_in_submission_order() {
        let consensus = LocalConsensusBuilder::new()
            .generated_validators("test", 5)
            .build();

        for id in [3, 1, 2] {
            consensus.generate_ordering_proof(&enforced(id)).await.unwrap();
        }

        let proofs = consensus.recent_proofs();
        assert_eq!(
            proofs.iter().map(|p| p.tx).collect::<Vec<_>>(),
            vec![TxId(3), TxId(1), TxId(2)]
        );
        consensus.verify_recent().unwrap();
        assert_eq!(consensus.stats().proofs_generated, 3);
        assert_eq!(consensus.stats().last_sequence, 3);
    }

    #[tokio::test]
    async fn test_unenforced_fee_rejected() {
        let consensus = LocalConsensusBuilder::new()
            .generated_validators("test", 5)
            .build();
        let tx = Transaction::new(TxId(1), 10_000, 20, 100, 1);

        let err = consensus.generate_ordering_proof(&tx).await.unwrap_err();
        assert!(matches!(err, ConsensusError::ProofRejected { tx: TxId(1), .. }));
        assert_eq!(consensus.stats().proofs_rejected, 1);
        assert_eq!(consensus.root(), [0u8; 32]);
    }

    #[tokio::test]
    async fn test_committee_and_quorum() {
        let consensus = LocalConsensusBuilder::new()
            .generated_validators("quorum", 4)
            .committee_size(3)
            .quorum(3)
            .build();

        let committee = consensus.select_validators(SubBlockId(1)).await.unwrap();
        assert_eq!(committee.len(), 3);

        for validator in committee.iter().take(2) {
            consensus.set_active(*validator, false);
        }
        let err = consensus.select_validators(SubBlockId(2)).await.unwrap_err();
        assert_eq!(
            err,
            ConsensusError::NoQuorum {
                available: 2,
                required: 3
            }
        );

        let stats = consensus.stats();
        assert_eq!(stats.committees_selected, 1);
        assert_eq!(stats.quorum_failures, 1);
        assert_eq!(stats.active_validators, 2);
        assert_eq!(stats.validators, 4);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["quorum_failures"], 1);
    }
}
