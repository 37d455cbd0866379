//! # Storage Module
//!
//! Durable block storage and the adapter that maps index pages onto it.
//!
//! - `BlockStore`: address -> bytes, atomic batched writes, gated deletion
//! - `RedbBlockStore`: production store on redb
//! - `MemoryBlockStore`: in-process store for tests and scratch graphs
//! - `PageStore` + adapter functions: page arena, hydrate and persist

mod adapter;
mod block;
mod memory;
mod redb_store;

pub use adapter::{IntegrityCheck, PageDelta, PageStore, hydrate, initialize, persist, verify};
pub(crate) use adapter::{discard, stage_empty};
pub use block::{Block, BlockStore};
pub use memory::MemoryBlockStore;
pub use redb_store::RedbBlockStore;
