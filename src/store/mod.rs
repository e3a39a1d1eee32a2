//! Ledger store implementations

pub mod disk;
pub mod memory;
mod query;

pub use disk::DiskLedger;
pub use memory::MemoryLedger;
