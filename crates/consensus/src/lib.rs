//! Pipeline Consensus - local ordering proofs and validator committees
//!
//! Architecture:
//! - Every admitted transaction gets a link in a hash-chained ordering log
//! - Each sub-block is assigned a committee ranked deterministically from
//!   the active roster
//! - Committee selection fails when the roster drops below quorum

pub mod committee;
pub mod local;
pub mod sequencer;
pub mod types;

pub use committee::Roster;
pub use local::{LocalConsensus, LocalConsensusBuilder};
pub use sequencer::{verify_chain, OrderingSequencer};
pub use types::*;
