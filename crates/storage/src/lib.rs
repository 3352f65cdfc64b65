//! Storage for quorumkv: a CRC-framed write-ahead log plus a versioned
//! in-memory map with last-writer-wins reconciliation.

pub mod engine;
pub mod wal;

pub use engine::StorageEngine;
pub use wal::{Wal, WalEntry};
