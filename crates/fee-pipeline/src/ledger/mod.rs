//! Reference ledger and its on-disk persistence

mod memory;
mod persistence;

pub use memory::{LedgerSnapshot, LedgerStats, MemoryLedger};
pub use persistence::{LedgerMetadata, LedgerPersistence, PersistentStore};
