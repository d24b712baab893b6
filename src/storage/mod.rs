//! Storage engine module
//!
//! This module contains the storage engine components:
//! - Values and entity records
//! - Slotted pages and the pager
//! - Page cache
//! - Page chains and record placement
//! - Copy-on-write B+ tree

pub mod btree;
pub mod cache;
pub mod chain;
pub mod page;
pub mod pager;
pub mod record;
pub mod record_store;
pub mod value;

pub use btree::CowBTree;
pub use cache::{CacheStats, PageCache};
pub use page::{FileHeader, Page, PageId, PageType};
pub use pager::Pager;
pub use record::{Entity, EntityId};
pub use record_store::{AllocatorStats, PageStore, RecordLocation, TxnPages};
pub use value::Value;
