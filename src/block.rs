mod marshal;

pub use marshal::{MarshalType, StorageBlock};

use crate::encoding::common_prefix_len;
use crate::error::{Error, Result};

/// Upper bound for the number of item bytes buffered by a single block.
pub const MAX_INMEMORY_BLOCK_SIZE: usize = 64 * 1024;

/// An item is a byte range inside the backing buffer of the block owning it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Item {
    pub start: u32,
    pub end: u32,
}

impl Item {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start as u32,
            end: end as u32,
        }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns the bytes of the item. Panics if the range is outside of `data`.
    pub fn bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.start as usize..self.end as usize]
    }

    /// Returns the bytes of the item, or `None` if the range is outside of `data`.
    pub fn get<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        if self.start > self.end {
            return None;
        }
        data.get(self.start as usize..self.end as usize)
    }
}

/// A bounded in-memory batch of items sharing one backing buffer.
///
/// Items are appended unsorted by ingestion, then sorted and marshaled into a
/// [`StorageBlock`] when the block is written into a part.
#[derive(Clone, Debug)]
pub struct InMemoryBlock {
    pub(crate) common_prefix: Vec<u8>,
    pub(crate) data: Vec<u8>,
    pub(crate) items: Vec<Item>,
    max_size: usize,
}

impl Default for InMemoryBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBlock {
    pub fn new() -> Self {
        Self::with_max_size(MAX_INMEMORY_BLOCK_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            common_prefix: Vec::new(),
            data: Vec::new(),
            items: Vec::new(),
            max_size,
        }
    }

    /// Builds a block from an arbitrary buffer and item ranges, checking that
    /// every range lies inside the buffer.
    pub fn from_raw(data: Vec<u8>, items: Vec<Item>, max_size: usize) -> Result<Self> {
        if data.len() > u32::MAX as usize {
            return Err(Error::Validation(format!(
                "block data of {} bytes exceeds the 4GiB limit",
                data.len()
            )));
        }
        if let Some((i, it)) = items
            .iter()
            .enumerate()
            .find(|(_, it)| it.get(&data).is_none())
        {
            return Err(Error::Validation(format!(
                "item #{i} [{}, {}) is out of bounds of {} data bytes",
                it.start,
                it.end,
                data.len()
            )));
        }
        Ok(Self {
            common_prefix: Vec::new(),
            data,
            items,
            max_size,
        })
    }

    /// Appends `item` to the block. Returns false when the block is full.
    #[must_use]
    pub fn add(&mut self, item: &[u8]) -> bool {
        if self.data.len() + item.len() > self.max_size {
            return false;
        }
        let start = self.data.len();
        self.data.extend_from_slice(item);
        self.items.push(Item::new(start, self.data.len()));
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of buffered bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn common_prefix(&self) -> &[u8] {
        &self.common_prefix
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn item(&self, idx: usize) -> &[u8] {
        self.items[idx].bytes(&self.data)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.items.iter().map(|it| it.bytes(&self.data))
    }

    pub fn reset(&mut self) {
        self.common_prefix.clear();
        self.data.clear();
        self.items.clear();
    }

    /// Takes the backing buffer and the items out of the block, leaving it empty.
    pub fn take_raw(&mut self) -> (Vec<u8>, Vec<Item>) {
        self.common_prefix.clear();
        (
            std::mem::take(&mut self.data),
            std::mem::take(&mut self.items),
        )
    }

    /// Sorts items lexicographically and refreshes the common prefix.
    pub fn sort_items(&mut self) {
        if self.is_sorted() {
            self.update_common_prefix_sorted();
            return;
        }
        self.update_common_prefix_unsorted();
        let cp_len = self.common_prefix.len();
        let data = &self.data;
        self.items.sort_unstable_by(|a, b| {
            data[a.start as usize + cp_len..a.end as usize]
                .cmp(&data[b.start as usize + cp_len..b.end as usize])
        });
    }

    pub(crate) fn is_sorted(&self) -> bool {
        self.items
            .windows(2)
            .all(|w| w[0].bytes(&self.data) <= w[1].bytes(&self.data))
    }

    /// For sorted items the common prefix of the first and the last item is
    /// shared by everything in between.
    pub(crate) fn update_common_prefix_sorted(&mut self) {
        self.common_prefix.clear();
        let (Some(first), Some(last)) = (self.items.first(), self.items.last()) else {
            return;
        };
        let first = first.bytes(&self.data);
        let cp_len = common_prefix_len(first, last.bytes(&self.data));
        self.common_prefix.extend_from_slice(&first[..cp_len]);
    }

    fn update_common_prefix_unsorted(&mut self) {
        self.common_prefix.clear();
        let Some(first) = self.items.first() else {
            return;
        };
        let mut cp = first.bytes(&self.data);
        for it in &self.items[1..] {
            let item = it.bytes(&self.data);
            if item.starts_with(cp) {
                continue;
            }
            let cp_len = common_prefix_len(cp, item);
            if cp_len == 0 {
                return;
            }
            cp = &cp[..cp_len];
        }
        self.common_prefix.extend_from_slice(cp);
    }
}
