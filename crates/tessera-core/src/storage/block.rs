use crate::{Address, TesseraError};

/// One durable block: opaque content plus the addresses it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub address: Address,
    pub content: Vec<u8>,
    /// Outgoing references. Blocks listed here are kept alive by this one.
    pub children: Vec<Address>,
}

impl Block {
    #[must_use]
    pub fn new(address: Address, content: Vec<u8>, children: Vec<Address>) -> Self {
        Self {
            address,
            content,
            children,
        }
    }
}

/// Durable key/value substrate for index blocks.
///
/// Implementations must make `put` atomic: after a crash either the whole
/// batch (writes and deletions) is visible or none of it is. Read methods
/// never observe a partially applied batch.
pub trait BlockStore: Send + Sync {
    /// Read one block.
    fn get(&self, address: Address) -> Result<Option<Block>, TesseraError>;

    /// Write `blocks` and then delete every candidate that no remaining
    /// block references, as one atomic batch.
    ///
    /// Deleting a candidate drops its own outgoing references, which can
    /// free other candidates; the check is repeated until nothing changes.
    /// Candidates that are still referenced are left in place.
    fn put(&self, blocks: Vec<Block>, delete_candidates: &[Address]) -> Result<(), TesseraError>;

    /// Every stored block, in address order.
    fn scan(&self) -> Result<Vec<Block>, TesseraError>;

    /// Addresses referenced by some block but absent from the store.
    fn missing_references(&self) -> Result<Vec<Address>, TesseraError>;

    /// Remove every block.
    fn clear(&self) -> Result<(), TesseraError>;

    /// Number of stored blocks.
    fn block_count(&self) -> Result<u64, TesseraError>;

    /// Reclaim space left behind by deleted blocks, where the substrate
    /// supports it.
    fn compact(&self) -> Result<(), TesseraError> {
        Ok(())
    }

    /// Release the underlying resources. Later calls fail with `StorageIo`.
    fn close(&self) -> Result<(), TesseraError>;
}
