//! Validator roster and deterministic committee selection

use fee_pipeline::ConsensusError;
use parking_lot::RwLock;
use pipeline_types::{SubBlockId, ValidatorId};
use std::collections::BTreeMap;

/// Known validators and whether each is currently active
pub struct Roster {
    members: RwLock<BTreeMap<ValidatorId, bool>>,
    seed: [u8; 32],
}

impl Roster {
    pub fn new(validators: impl IntoIterator<Item = ValidatorId>, seed: [u8; 32]) -> Self {
        Self {
            members: RwLock::new(validators.into_iter().map(|v| (v, true)).collect()),
            seed,
        }
    }

    /// Mark a validator active or inactive. Unknown validators are added.
    pub fn set_active(&self, validator: ValidatorId, active: bool) {
        self.members.write().insert(validator, active);
    }

    pub fn active(&self) -> Vec<ValidatorId> {
        self.members
            .read()
            .iter()
            .filter(|(_, active)| **active)
            .map(|(validator, _)| *validator)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Rank active validators for a sub-block and take the top `size`.
    /// The same roster and sub-block always give the same committee.
    pub fn select(
        &self,
        sub_block: SubBlockId,
        size: usize,
        quorum: usize,
    ) -> Result<Vec<ValidatorId>, ConsensusError> {
        let active = self.active();
        if active.len() < quorum || active.is_empty() {
            return Err(ConsensusError::NoQuorum {
                available: active.len(),
                required: quorum.max(1),
            });
        }

        let mut ranked: Vec<([u8; 32], ValidatorId)> = active
            .into_iter()
            .map(|validator| (self.rank(sub_block, &validator), validator))
            .collect();
        ranked.sort_unstable();

        Ok(ranked
            .into_iter()
            .take(size.max(1))
            .map(|(_, validator)| validator)
            .collect())
    }

    fn rank(&self, sub_block: SubBlockId, validator: &ValidatorId) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed);
        hasher.update(&sub_block.0.to_le_bytes());
        hasher.update(&validator.0);
        *hasher.finalize().as_bytes()
    }
}
