//! # Index Module
//!
//! Persistent, storage-backed B+trees over datoms.
//!
//! Each index is a tree of immutable pages addressed by `Address`. A
//! mutation never edits a page in place: it allocates new pages along the
//! touched root-to-leaf path and returns a new root, so every older root
//! keeps describing exactly the tree it described before.

mod iter;
mod order;
mod page;
mod tree;

pub use iter::DatomIter;
pub use order::IndexOrder;
pub use page::Page;
pub(crate) use tree::{TreeWriter, collect_pages};

use crate::Address;
use serde::{Deserialize, Serialize};

/// Root page addresses of the three indexes of one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoots {
    pub eavt: Address,
    pub aevt: Address,
    pub avet: Address,
}

impl IndexRoots {
    /// Root of the given index.
    #[must_use]
    pub fn get(&self, order: IndexOrder) -> Address {
        match order {
            IndexOrder::Eavt => self.eavt,
            IndexOrder::Aevt => self.aevt,
            IndexOrder::Avet => self.avet,
        }
    }

    /// Replace the root of the given index.
    pub fn set(&mut self, order: IndexOrder, root: Address) {
        match order {
            IndexOrder::Eavt => self.eavt = root,
            IndexOrder::Aevt => self.aevt = root,
            IndexOrder::Avet => self.avet = root,
        }
    }

    /// All three roots, in `IndexOrder::ALL` order.
    #[must_use]
    pub fn addresses(&self) -> [Address; 3] {
        [self.eavt, self.aevt, self.avet]
    }
}
