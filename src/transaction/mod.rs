//! Transaction module
//!
//! This module contains versions, snapshots, and the transaction manager.

mod persist;
pub mod snapshot;
mod state;
pub mod transaction;
pub mod version;
pub mod view;

pub use snapshot::{SnapshotGuard, SnapshotRegistry};
pub use transaction::{
    CompactionStats, ReadTxn, StoreStats, TransactionManager, TransactionState, WriteTxn,
};
pub use version::{ChainKey, Version};
pub use view::ReadView;
