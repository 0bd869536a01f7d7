use std::cmp::Ordering;
use std::collections::binary_heap::PeekMut;
use std::collections::BinaryHeap;
use std::sync::Arc;

use super::part_wrapper::PartWrapper;
use super::Table;
use crate::error::Result;
use crate::part::PartSearch;

/// A part search ordered by its current item, smallest on top of the heap.
struct HeapEntry(PartSearch);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.item() == other.0.item()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.item().cmp(self.0.item())
    }
}

/// Searches the items of a snapshot of the table's parts.
///
/// Parts merged away while the search is alive stay readable until the search
/// is dropped.
pub struct TableSearch {
    pws: Vec<Arc<PartWrapper>>,
    heap: BinaryHeap<HeapEntry>,
    /// Searches that are exhausted for the current seek.
    idle: Vec<PartSearch>,
    /// The heap top is already positioned at the item `next_item` must yield.
    next_item_noop: bool,
    has_item: bool,
}

impl TableSearch {
    pub fn new(table: &Table) -> Self {
        let pws: Vec<Arc<PartWrapper>> = {
            let parts = table.inner.parts.read();
            for pw in parts.iter() {
                pw.inc_ref();
            }
            parts.clone()
        };
        let idle = pws
            .iter()
            .map(|pw| PartSearch::new(pw.part.clone()))
            .collect();
        Self {
            pws,
            heap: BinaryHeap::new(),
            idle,
            next_item_noop: false,
            has_item: false,
        }
    }

    /// Positions the search so that [`TableSearch::next_item`] yields items
    /// starting from the first one that is greater or equal to `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        let mut searches: Vec<PartSearch> = self.heap.drain().map(|entry| entry.0).collect();
        searches.append(&mut self.idle);
        self.next_item_noop = false;
        self.has_item = false;

        let mut result = Ok(());
        for mut ps in searches {
            if result.is_ok() {
                match ps.seek(key).and_then(|()| ps.next_item()) {
                    Ok(true) => {
                        self.heap.push(HeapEntry(ps));
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => result = Err(e),
                }
            }
            self.idle.push(ps);
        }
        if result.is_err() {
            self.idle.extend(self.heap.drain().map(|entry| entry.0));
        }
        self.next_item_noop = !self.heap.is_empty();
        result
    }

    /// Advances to the next item across all parts. Returns false once every
    /// part is exhausted.
    pub fn next_item(&mut self) -> Result<bool> {
        if self.next_item_noop {
            self.next_item_noop = false;
            self.has_item = true;
            return Ok(true);
        }
        let Some(mut top) = self.heap.peek_mut() else {
            self.has_item = false;
            return Ok(false);
        };
        match top.0.next_item() {
            // Dropping `top` restores the heap order.
            Ok(true) => drop(top),
            Ok(false) => self.idle.push(PeekMut::pop(top).0),
            Err(e) => {
                self.idle.push(PeekMut::pop(top).0);
                self.has_item = false;
                return Err(e);
            }
        }
        self.has_item = !self.heap.is_empty();
        Ok(self.has_item)
    }

    /// The item found by the last successful [`TableSearch::next_item`].
    pub fn item(&self) -> &[u8] {
        match self.heap.peek() {
            Some(entry) if self.has_item => entry.0.item(),
            _ => &[],
        }
    }

    /// Returns the first item starting with `prefix`, if any.
    pub fn first_item_with_prefix(&mut self, prefix: &[u8]) -> Result<Option<Vec<u8>>> {
        self.seek(prefix)?;
        if !self.next_item()? {
            return Ok(None);
        }
        let item = self.item();
        Ok(item.starts_with(prefix).then(|| item.to_vec()))
    }
}

impl Drop for TableSearch {
    fn drop(&mut self) {
        // Part searches must not outlive the references.
        self.heap.clear();
        self.idle.clear();
        for pw in self.pws.drain(..) {
            pw.dec_ref();
        }
    }
}
