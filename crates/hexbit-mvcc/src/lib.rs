//! Hierarchical differential bitmap version chains for MVCC snapshot reads.
//!
//! The store keeps a time-ordered history of fixed-width visibility bitmaps,
//! addressed by commit sequence number (CSN). Versions are grouped behind
//! shared reference bitmaps and encoded as sparse or dense XOR differences;
//! writers insert through a two-stage reserve/finalize protocol while readers
//! reconstruct historical snapshots without taking any lock.

mod chain;
pub mod controller;
pub mod delta;
pub mod ebr;
pub mod gc;

pub use controller::{BITMAP_BYTES, BitmapVersionStore, GROUP_FANOUT, InsertTicket};
pub use delta::{
    Delta, PositionList, decode, dense_threshold, encode, strictly_ascending, union_positions,
};
pub use ebr::{
    ChainMetrics, ChainMetricsSnapshot, GLOBAL_CHAIN_METRICS, ReaderPinSnapshot, ReaderRegistry,
    SnapshotGuard, StaleReaderConfig,
};
pub use gc::ReclaimResult;
