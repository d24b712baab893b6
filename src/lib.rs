//! boxdb - An embedded, transactional object store written in Rust
//!
//! This library provides the components of the store:
//! - Type registry and schema catalog
//! - Storage engine (checksummed pages, page cache, copy-on-write records)
//! - Secondary indexes over a path-copying B+ tree
//! - Snapshot transactions with optimistic concurrency control
//! - Queries (predicates, planner, executor, textual parser)
//! - Per-type boxes over the store

pub mod catalog;
pub mod config;
pub mod entity_box;
pub mod error;
pub mod index;
pub mod query;
pub mod storage;
pub mod store;
pub mod transaction;

pub use catalog::{Date, EntityDef, PropertyDef, PropertyType, Schema, TypeTag};
pub use config::StoreConfig;
pub use entity_box::{EntityBox, Persistable, ReadBox, TxnBox, TypedBox};
pub use error::{Error, Result};
pub use query::{CancellationToken, OrderKey, Predicate, Query, QueryIter};
pub use storage::{Entity, EntityId, Value};
pub use store::Store;
pub use transaction::{ReadTxn, TransactionState, WriteTxn};
