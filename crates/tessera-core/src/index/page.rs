use crate::{Address, Datom};
use serde::{Deserialize, Serialize};

/// One immutable node of an index tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Page {
    /// A sorted run of datoms.
    Leaf(Vec<Datom>),
    /// Separator keys and child addresses. `keys[i]` is the greatest datom
    /// stored under `children[i]`.
    Branch {
        keys: Vec<Datom>,
        children: Vec<Address>,
    },
}

impl Page {
    /// Number of entries (datoms or children).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Leaf(datoms) => datoms.len(),
            Self::Branch { children, .. } => children.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Addresses this page references. Empty for leaves.
    #[must_use]
    pub fn child_addresses(&self) -> &[Address] {
        match self {
            Self::Leaf(_) => &[],
            Self::Branch { children, .. } => children,
        }
    }
}
