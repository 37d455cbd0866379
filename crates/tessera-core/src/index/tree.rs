//! Copy-on-write insert and remove over page trees.

use super::{IndexOrder, Page};
use crate::primitives::{PAGE_CAPACITY, PAGE_MIN_FILL};
use crate::storage::{PageDelta, PageStore};
use crate::{Address, Datom, TesseraError};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Range;

/// `(greatest datom under child, child address)` as stored in a branch.
type Entry = (Datom, Address);

/// Applies single-datom mutations to index trees.
///
/// Every page that a mutation replaces is recorded in the delta: pages that
/// were allocated earlier in the same batch are evicted at once, pages from
/// a published snapshot become `superseded` and are only ever handed to the
/// block store as delete candidates.
pub(crate) struct TreeWriter<'a> {
    pages: &'a PageStore,
    delta: &'a mut PageDelta,
}

impl<'a> TreeWriter<'a> {
    pub(crate) fn new(pages: &'a PageStore, delta: &'a mut PageDelta) -> Self {
        Self { pages, delta }
    }

    /// Allocate an empty tree.
    pub(crate) fn empty_root(&mut self) -> Address {
        self.alloc(Page::Leaf(Vec::new()))
    }

    /// Insert `datom`. Returns the new root, or `None` if the datom (by
    /// `(e, a, v)` identity) was already present.
    pub(crate) fn insert(
        &mut self,
        order: IndexOrder,
        root: Address,
        datom: &Datom,
    ) -> Result<Option<Address>, TesseraError> {
        match self.insert_at(order, root, datom)? {
            None => Ok(None),
            Some(entries) => Ok(Some(self.build_root(entries)?)),
        }
    }

    /// Remove `datom`. Returns the new root, or `None` if it was absent.
    pub(crate) fn remove(
        &mut self,
        order: IndexOrder,
        root: Address,
        datom: &Datom,
    ) -> Result<Option<Address>, TesseraError> {
        match self.remove_at(order, root, datom)? {
            None => Ok(None),
            Some(entries) => Ok(Some(self.build_root(entries)?)),
        }
    }

    // =========================================================================
    // RECURSION
    // =========================================================================

    fn insert_at(
        &mut self,
        order: IndexOrder,
        address: Address,
        datom: &Datom,
    ) -> Result<Option<Vec<Entry>>, TesseraError> {
        let page = self.pages.load(address)?;
        match page.as_ref() {
            Page::Leaf(datoms) => match datoms.binary_search_by(|d| order.compare(d, datom)) {
                Ok(_) => Ok(None),
                Err(pos) => {
                    let mut datoms = datoms.clone();
                    datoms.insert(pos, datom.clone());
                    self.retire(address);
                    Ok(Some(self.emit_leaves(datoms)))
                }
            },
            Page::Branch { keys, children } => {
                let (slot, child) = child_slot(order, address, keys, children, datom)?;
                let Some(replacement) = self.insert_at(order, child, datom)? else {
                    return Ok(None);
                };
                let (mut keys, mut children) = (keys.clone(), children.clone());
                splice(&mut keys, &mut children, slot..slot + 1, replacement);
                self.retire(address);
                Ok(Some(self.emit_branches(keys, children)))
            }
        }
    }

    fn remove_at(
        &mut self,
        order: IndexOrder,
        address: Address,
        datom: &Datom,
    ) -> Result<Option<Vec<Entry>>, TesseraError> {
        let page = self.pages.load(address)?;
        match page.as_ref() {
            Page::Leaf(datoms) => match datoms.binary_search_by(|d| order.compare(d, datom)) {
                Err(_) => Ok(None),
                Ok(pos) => {
                    let mut datoms = datoms.clone();
                    datoms.remove(pos);
                    self.retire(address);
                    Ok(Some(self.emit_leaves(datoms)))
                }
            },
            Page::Branch { keys, children } => {
                let (slot, child) = child_slot(order, address, keys, children, datom)?;
                let Some(replacement) = self.remove_at(order, child, datom)? else {
                    return Ok(None);
                };
                let survived = replacement.len() == 1;
                let (mut keys, mut children) = (keys.clone(), children.clone());
                splice(&mut keys, &mut children, slot..slot + 1, replacement);
                if survived {
                    self.rebalance(&mut keys, &mut children, slot)?;
                }
                self.retire(address);
                Ok(Some(self.emit_branches(keys, children)))
            }
        }
    }

    /// Merge an underfull child with a sibling. The merged run is re-split
    /// when it overflows, which redistributes entries evenly.
    fn rebalance(
        &mut self,
        keys: &mut Vec<Datom>,
        children: &mut Vec<Address>,
        slot: usize,
    ) -> Result<(), TesseraError> {
        if children.len() < 2 {
            return Ok(());
        }
        let child = self.pages.load(children[slot])?;
        if child.len() >= PAGE_MIN_FILL {
            return Ok(());
        }

        let lo = if slot + 1 < children.len() { slot } else { slot - 1 };
        let (left_address, right_address) = (children[lo], children[lo + 1]);
        let left = self.pages.load(left_address)?;
        let right = self.pages.load(right_address)?;

        let merged = match (left.as_ref(), right.as_ref()) {
            (Page::Leaf(a), Page::Leaf(b)) => {
                let mut datoms = Vec::with_capacity(a.len() + b.len());
                datoms.extend(a.iter().cloned());
                datoms.extend(b.iter().cloned());
                self.retire(left_address);
                self.retire(right_address);
                self.emit_leaves(datoms)
            }
            (
                Page::Branch { keys: ka, children: ca },
                Page::Branch { keys: kb, children: cb },
            ) => {
                let mut merged_keys = ka.clone();
                merged_keys.extend(kb.iter().cloned());
                let mut merged_children = ca.clone();
                merged_children.extend(cb.iter().copied());
                self.retire(left_address);
                self.retire(right_address);
                self.emit_branches(merged_keys, merged_children)
            }
            _ => {
                return Err(TesseraError::CorruptIndex {
                    address: left_address,
                    reason: "sibling pages at different depths".to_string(),
                });
            }
        };
        splice(keys, children, lo..lo + 2, merged);
        Ok(())
    }

    // =========================================================================
    // PAGE EMISSION
    // =========================================================================

    /// Turn the entries left at the top of a mutation into a single root,
    /// growing a level on split and dropping single-child branches.
    fn build_root(&mut self, mut entries: Vec<Entry>) -> Result<Address, TesseraError> {
        while entries.len() > 1 {
            let (keys, children) = entries.into_iter().unzip();
            entries = self.emit_branches(keys, children);
        }
        let Some((_, mut root)) = entries.pop() else {
            return Ok(self.empty_root());
        };

        loop {
            let page = self.pages.load(root)?;
            match page.as_ref() {
                Page::Branch { children, .. } if children.len() == 1 => {
                    let only = children[0];
                    self.retire(root);
                    root = only;
                }
                _ => return Ok(root),
            }
        }
    }

    fn emit_leaves(&mut self, datoms: Vec<Datom>) -> Vec<Entry> {
        let mut entries = Vec::new();
        for chunk in partition(datoms) {
            let Some(max) = chunk.last().cloned() else {
                continue;
            };
            entries.push((max, self.alloc(Page::Leaf(chunk))));
        }
        entries
    }

    fn emit_branches(&mut self, keys: Vec<Datom>, children: Vec<Address>) -> Vec<Entry> {
        let pairs: Vec<Entry> = keys.into_iter().zip(children).collect();
        let mut entries = Vec::new();
        for chunk in partition(pairs) {
            let Some(max) = chunk.last().map(|(k, _)| k.clone()) else {
                continue;
            };
            let (keys, children) = chunk.into_iter().unzip();
            entries.push((max, self.alloc(Page::Branch { keys, children })));
        }
        entries
    }

    fn alloc(&mut self, page: Page) -> Address {
        let address = self.pages.allocate(page);
        self.delta.allocated.insert(address);
        address
    }

    fn retire(&mut self, address: Address) {
        if self.delta.allocated.remove(&address) {
            self.pages.evict(address);
        } else {
            self.delta.superseded.insert(address);
        }
    }
}

/// Slot and address of the child whose range covers `datom`. Datoms beyond
/// the last separator belong to the last child.
fn child_slot(
    order: IndexOrder,
    address: Address,
    keys: &[Datom],
    children: &[Address],
    datom: &Datom,
) -> Result<(usize, Address), TesseraError> {
    if keys.is_empty() || keys.len() != children.len() {
        return Err(TesseraError::CorruptIndex {
            address,
            reason: format!(
                "branch page with {} keys and {} children",
                keys.len(),
                children.len()
            ),
        });
    }
    let slot = keys
        .partition_point(|k| order.compare(k, datom) == Ordering::Less)
        .min(keys.len() - 1);
    Ok((slot, children[slot]))
}

fn splice(keys: &mut Vec<Datom>, children: &mut Vec<Address>, range: Range<usize>, entries: Vec<Entry>) {
    let (new_keys, new_children): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
    keys.splice(range.clone(), new_keys);
    children.splice(range, new_children);
}

/// Split a run into the fewest pieces of at most `PAGE_CAPACITY`, sized as
/// evenly as possible.
fn partition<T>(items: Vec<T>) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let pieces = items.len().div_ceil(PAGE_CAPACITY);
    let base = items.len() / pieces;
    let extra = items.len() % pieces;

    let mut out = Vec::with_capacity(pieces);
    let mut iter = items.into_iter();
    for i in 0..pieces {
        let size = base + usize::from(i < extra);
        out.push(iter.by_ref().take(size).collect());
    }
    out
}

/// Every page address reachable from `root`.
pub(crate) fn collect_pages(
    pages: &PageStore,
    root: Address,
) -> Result<BTreeSet<Address>, TesseraError> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(address) = stack.pop() {
        if !seen.insert(address) {
            continue;
        }
        let page = pages.load(address)?;
        stack.extend(page.child_addresses().iter().copied());
    }
    Ok(seen)
}
