//! Node Configuration

use fee_pipeline::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Synthetic load settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Generate submissions and completions
    pub enabled: bool,
    /// Submissions per second
    pub rate_per_sec: u64,
    /// Transfer amount range in minor units
    pub min_amount: u64,
    pub max_amount: u64,
    /// How often finalized transactions are marked completed
    pub completion_interval_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_per_sec: 200,
            min_amount: 10_000,
            max_amount: 5_000_000,
            completion_interval_ms: 500,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub pipeline: PipelineConfig,
    /// Validators in the local roster
    pub validators: usize,
    pub committee_size: usize,
    pub quorum: usize,
    /// Finalized sub-blocks per block
    pub sub_blocks_per_block: usize,
    pub simulation: SimulationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            validators: 7,
            committee_size: 4,
            quorum: 3,
            sub_blocks_per_block: 10,
            simulation: SimulationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                let config: NodeConfig = serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("Invalid config {:?}: {}", path, e))?;
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            None => NodeConfig::default(),
        };
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.pipeline.validate()?;
        if self.quorum > self.validators {
            anyhow::bail!(
                "quorum ({}) exceeds the number of validators ({})",
                self.quorum,
                self.validators
            );
        }
        if self.committee_size == 0 || self.sub_blocks_per_block == 0 {
            anyhow::bail!("committee_size and sub_blocks_per_block must be non-zero");
        }
        if self.simulation.min_amount > self.simulation.max_amount {
            anyhow::bail!("simulation.min_amount exceeds simulation.max_amount");
        }
        Ok(())
    }
}
