//! Shared types for the fee-governed admission pipeline
//!
//! Everything the pipeline, its collaborators, and the node binary exchange:
//! transactions, sub-blocks, blocks, fee bounds and settlement records.
//! All money values are integer minor units; rates are parts-per-million.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Precision for rate calculations (1_000_000 = 100%)
pub const PERCENTAGE_PRECISION: u128 = 1_000_000;

/// Precision of the network load signal (10_000 = fully loaded)
pub const LOAD_PRECISION: u16 = 10_000;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
            Serialize, Deserialize, BorshSerialize, BorshDeserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            pub fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Transaction identifier
    TxId,
    "tx#"
);
id_type!(
    /// Sub-block identifier, assigned by the batcher
    SubBlockId,
    "sb#"
);
id_type!(
    /// Block identifier, assigned by the ledger
    BlockId,
    "blk#"
);

/// Validator identity as handed out by the consensus collaborator
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct ValidatorId(pub [u8; 32]);

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Normalized network load in basis points (0 = idle, 10_000 = saturated)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NetworkLoad(u16);

impl NetworkLoad {
    pub const IDLE: Self = Self(0);
    pub const SATURATED: Self = Self(LOAD_PRECISION);

    /// Build from basis points, saturating at 10_000
    pub fn from_bps(bps: u16) -> Self {
        Self(bps.min(LOAD_PRECISION))
    }

    /// Build from a ratio in `[0, 1]`. Out-of-range and NaN inputs are clamped.
    pub fn from_ratio(ratio: f64) -> Self {
        if !ratio.is_finite() || ratio <= 0.0 {
            return Self::IDLE;
        }
        if ratio >= 1.0 {
            return Self::SATURATED;
        }
        Self((ratio * LOAD_PRECISION as f64).round() as u16)
    }

    pub fn bps(self) -> u16 {
        self.0
    }

    pub fn as_ratio(self) -> f64 {
        self.0 as f64 / LOAD_PRECISION as f64
    }
}

impl fmt::Display for NetworkLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.as_ratio())
    }
}

/// Ciphertext produced by the encryption service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Sealed {
    pub nonce: [u8; 24],
    pub ciphertext: Vec<u8>,
}

/// A submitted transaction as seen by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub id: TxId,
    /// Transferred amount in minor units
    pub amount: u64,
    /// Fee charged in minor units (clamped once by the enforcer)
    pub fee: u64,
    /// Sealed form of `fee`, present once the fee has been enforced
    pub fee_sealed: Option<Sealed>,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Price per gas unit in minor units
    pub gas_price: u64,
    pub receipt_generated: bool,
    pub completed: bool,
}

impl Transaction {
    /// Create a fresh, unenforced transaction
    pub fn new(id: TxId, amount: u64, fee: u64, gas_limit: u64, gas_price: u64) -> Self {
        Self {
            id,
            amount,
            fee,
            fee_sealed: None,
            gas_limit,
            gas_used: 0,
            gas_price,
            receipt_generated: false,
            completed: false,
        }
    }

    /// Whether the enforcer has already clamped and sealed the fee
    pub fn is_fee_enforced(&self) -> bool {
        self.fee_sealed.is_some()
    }
}

/// A bounded, ordered group of transactions proposed for validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct SubBlock {
    pub id: SubBlockId,
    /// Admission order
    pub transactions: Vec<Transaction>,
    /// Validator set assigned during validation
    pub validators: Vec<ValidatorId>,
    pub validated: bool,
    pub finalized: bool,
    /// Assigned by the ledger when the sub-block is finalized
    pub parent_block: Option<BlockId>,
}

impl SubBlock {
    pub fn new(id: SubBlockId, transactions: Vec<Transaction>) -> Self {
        Self {
            id,
            transactions,
            validators: Vec::new(),
            validated: false,
            finalized: false,
            parent_block: None,
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn tx_ids(&self) -> Vec<TxId> {
        self.transactions.iter().map(|tx| tx.id).collect()
    }

    /// Sum of all transaction fees, `None` on overflow
    pub fn total_fee(&self) -> Option<u64> {
        self.transactions
            .iter()
            .try_fold(0u64, |acc, tx| acc.checked_add(tx.fee))
    }
}

/// An ordered group of sub-blocks proposed for finalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub id: BlockId,
    pub sub_blocks: Vec<SubBlockId>,
    pub validated: bool,
    pub finalized: bool,
}

impl Block {
    pub fn new(id: BlockId, sub_blocks: Vec<SubBlockId>) -> Self {
        Self {
            id,
            sub_blocks,
            validated: false,
            finalized: false,
        }
    }
}

/// Item handed to `Ledger::finalize`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum FinalizeTarget {
    SubBlock(SubBlockId),
    Block(BlockId),
}

impl fmt::Display for FinalizeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeTarget::SubBlock(id) => id.fmt(f),
            FinalizeTarget::Block(id) => id.fmt(f),
        }
    }
}

/// Opaque finalization tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct FinalizationTag(pub [u8; 32]);

/// Current fee bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBounds {
    /// Absolute minimum fee in minor units
    pub floor: u64,
    /// Dynamic ceiling rate in ppm of the amount
    pub sub_ceiling_ppm: u64,
    /// Fixed ceiling rate in ppm of the amount, never exceeded
    pub fixed_ceiling_ppm: u64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub enum RefundKind {
    Gas,
    Fee,
}

impl fmt::Display for RefundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefundKind::Gas => f.write_str("gas"),
            RefundKind::Fee => f.write_str("fee"),
        }
    }
}

/// Reward distribution entry, one per sub-block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRecord {
    pub sub_block: SubBlockId,
    pub amount: u64,
    /// Unix millis
    pub at: i64,
}

/// Refund entry, one per (transaction, kind)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub tx: TxId,
    pub kind: RefundKind,
    pub amount: Sealed,
    /// Unix millis
    pub at: i64,
}
