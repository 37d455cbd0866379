use super::{IndexOrder, Page};
use crate::query::Pattern;
use crate::storage::PageStore;
use crate::{Address, Datom, TesseraError};
use std::cmp::Ordering;
use std::sync::Arc;

struct Frame {
    page: Arc<Page>,
    pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Running,
    Done,
}

/// Lazy, ordered scan over the datoms of one index that match a pattern.
///
/// The iterator seeks to the first datom of the pattern's prefix range on
/// the first call to `next` and loads pages only as it reaches them. It ends
/// at the first datom past the range. A page that fails to load ends the
/// scan with that error.
pub struct DatomIter {
    pages: Arc<PageStore>,
    order: IndexOrder,
    root: Address,
    pattern: Pattern,
    stack: Vec<Frame>,
    state: State,
}

impl DatomIter {
    pub(crate) fn new(
        pages: Arc<PageStore>,
        order: IndexOrder,
        root: Address,
        pattern: Pattern,
    ) -> Self {
        Self {
            pages,
            order,
            root,
            pattern,
            stack: Vec::new(),
            state: State::Fresh,
        }
    }

    /// The index this iterator walks.
    #[must_use]
    pub fn order(&self) -> IndexOrder {
        self.order
    }

    fn seek(&mut self) -> Result<(), TesseraError> {
        let mut address = self.root;
        loop {
            let page = self.pages.load(address)?;
            match page.as_ref() {
                Page::Leaf(datoms) => {
                    let pos = datoms.partition_point(|d| {
                        self.order.compare_prefix(d, &self.pattern) == Ordering::Less
                    });
                    self.stack.push(Frame { page: Arc::clone(&page), pos });
                    return Ok(());
                }
                Page::Branch { keys, children } => {
                    let pos = keys.partition_point(|k| {
                        self.order.compare_prefix(k, &self.pattern) == Ordering::Less
                    });
                    let Some(&next) = children.get(pos) else {
                        // Every datom sorts before the range.
                        self.stack.clear();
                        return Ok(());
                    };
                    self.stack.push(Frame { page: Arc::clone(&page), pos });
                    address = next;
                }
            }
        }
    }

    /// Move to the first datom of the next leaf. Returns `false` at the end
    /// of the tree.
    fn advance(&mut self) -> Result<bool, TesseraError> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(false);
            };
            frame.pos += 1;
            let next = match frame.page.as_ref() {
                Page::Branch { children, .. } => children.get(frame.pos).copied(),
                Page::Leaf(_) => None,
            };
            match next {
                Some(address) => {
                    self.descend_leftmost(address)?;
                    return Ok(true);
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }

    fn descend_leftmost(&mut self, mut address: Address) -> Result<(), TesseraError> {
        loop {
            let page = self.pages.load(address)?;
            let first = page.child_addresses().first().copied();
            let is_leaf = page.is_leaf();
            self.stack.push(Frame { page, pos: 0 });
            match first {
                Some(child) => address = child,
                None if is_leaf => return Ok(()),
                None => {
                    return Err(TesseraError::CorruptIndex {
                        address,
                        reason: "branch page without children".to_string(),
                    });
                }
            }
        }
    }

    fn fail(&mut self, err: TesseraError) -> Option<Result<Datom, TesseraError>> {
        self.state = State::Done;
        self.stack.clear();
        Some(Err(err))
    }
}

impl Iterator for DatomIter {
    type Item = Result<Datom, TesseraError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            State::Done => return None,
            State::Fresh => {
                self.state = State::Running;
                if let Err(e) = self.seek() {
                    return self.fail(e);
                }
            }
            State::Running => {}
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.state = State::Done;
                return None;
            };
            let current = match frame.page.as_ref() {
                Page::Leaf(datoms) => datoms.get(frame.pos).cloned(),
                Page::Branch { .. } => None,
            };

            let Some(datom) = current else {
                match self.advance() {
                    Ok(true) => continue,
                    Ok(false) => {
                        self.state = State::Done;
                        return None;
                    }
                    Err(e) => return self.fail(e),
                }
            };
            frame.pos += 1;

            match self.order.compare_prefix(&datom, &self.pattern) {
                Ordering::Greater => {
                    self.state = State::Done;
                    self.stack.clear();
                    return None;
                }
                Ordering::Less => {}
                Ordering::Equal => {
                    if self.pattern.matches(&datom) {
                        return Some(Ok(datom));
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for DatomIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatomIter")
            .field("order", &self.order)
            .field("root", &self.root)
            .field("pattern", &self.pattern)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
