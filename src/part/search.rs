use std::sync::Arc;

use super::{IndexBlock, Part};
use crate::block::{InMemoryBlock, StorageBlock};
use crate::encoding::common_prefix_len;
use crate::error::Result;

/// Seeks and iterates items of a single part.
pub struct PartSearch {
    part: Arc<Part>,
    /// Next metaindex row to load.
    mr_idx: usize,
    index: Option<Arc<IndexBlock>>,
    /// Next block header of `index` to load.
    bh_idx: usize,
    sb: StorageBlock,
    ib: InMemoryBlock,
    /// Next item of `ib` to yield.
    ib_item_idx: usize,
    has_item: bool,
}

impl PartSearch {
    /// Creates a search positioned before the first item of `part`.
    pub fn new(part: Arc<Part>) -> Self {
        Self {
            part,
            mr_idx: 0,
            index: None,
            bh_idx: 0,
            sb: StorageBlock::default(),
            ib: InMemoryBlock::new(),
            ib_item_idx: 0,
            has_item: false,
        }
    }

    pub fn part(&self) -> &Arc<Part> {
        &self.part
    }

    fn reset(&mut self) {
        self.mr_idx = 0;
        self.index = None;
        self.bh_idx = 0;
        self.ib.reset();
        self.ib_item_idx = 0;
        self.has_item = false;
    }

    /// Positions the search so that [`PartSearch::next_item`] yields items
    /// starting from the first one that is greater or equal to `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.reset();
        let ph = self.part.header();
        if key > ph.last_item.as_slice() {
            self.mr_idx = self.part.metaindex().len();
            return Ok(());
        }
        if key <= ph.first_item.as_slice() {
            return Ok(());
        }

        // Items equal to `key` may live in the blocks preceding the first block
        // that starts with `key`, so step back to the last block starting below.
        let mrs = self.part.metaindex();
        self.mr_idx = mrs
            .partition_point(|mr| mr.first_item.as_slice() < key)
            .saturating_sub(1);
        let index = self.part.read_index_block_cached(&mrs[self.mr_idx])?;
        self.mr_idx += 1;
        self.bh_idx = index
            .bhs
            .partition_point(|bh| bh.first_item.as_slice() < key)
            .saturating_sub(1);
        self.index = Some(index);
        if !self.next_block()? {
            return Ok(());
        }

        let data = self.ib.data();
        let items = self.ib.items();
        let cp_len = common_prefix_len(self.ib.common_prefix(), key);
        self.ib_item_idx = if cp_len > 0 {
            let key_suffix = &key[cp_len..];
            items.partition_point(|it| {
                &data[it.start as usize + cp_len..it.end as usize] < key_suffix
            })
        } else {
            items.partition_point(|it| it.bytes(data) < key)
        };
        // Past the end of the block, `next_item` moves on to the next one.
        Ok(())
    }

    /// Advances to the next item. Returns false at the end of the part.
    pub fn next_item(&mut self) -> Result<bool> {
        loop {
            if self.ib_item_idx < self.ib.len() {
                self.ib_item_idx += 1;
                self.has_item = true;
                return Ok(true);
            }
            if !self.next_block()? {
                self.has_item = false;
                return Ok(false);
            }
        }
    }

    /// The item found by the last successful [`PartSearch::next_item`].
    pub fn item(&self) -> &[u8] {
        if !self.has_item {
            return &[];
        }
        self.ib.item(self.ib_item_idx - 1)
    }

    fn next_block(&mut self) -> Result<bool> {
        loop {
            if let Some(index) = &self.index {
                if self.bh_idx < index.bhs.len() {
                    break;
                }
            }
            let Some(mr) = self.part.metaindex().get(self.mr_idx) else {
                self.index = None;
                self.ib.reset();
                self.ib_item_idx = 0;
                return Ok(false);
            };
            self.index = Some(self.part.read_index_block_cached(mr)?);
            self.mr_idx += 1;
            self.bh_idx = 0;
        }
        let Some(index) = &self.index else {
            return Ok(false);
        };
        let bh = &index.bhs[self.bh_idx];
        self.part.read_block(bh, &mut self.sb, &mut self.ib)?;
        self.bh_idx += 1;
        self.ib_item_idx = 0;
        Ok(true)
    }
}
