use std::sync::Arc;

use crate::block::{InMemoryBlock, StorageBlock};
use crate::error::{Error, Result};
use crate::part::{IndexBlock, Part};

enum Source {
    /// A single frozen block, yielded once.
    InMemory { yielded: bool },
    Part(Box<PartCursor>),
}

struct PartCursor {
    part: Arc<Part>,
    mr_idx: usize,
    index: Option<Arc<IndexBlock>>,
    bh_idx: usize,
    sb: StorageBlock,
    items_read: u64,
    blocks_read: u64,
    prev_last_item: Vec<u8>,
}

impl PartCursor {
    fn new(part: Arc<Part>) -> Self {
        Self {
            part,
            mr_idx: 0,
            index: None,
            bh_idx: 0,
            sb: StorageBlock::default(),
            items_read: 0,
            blocks_read: 0,
            prev_last_item: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.mr_idx = 0;
        self.index = None;
        self.bh_idx = 0;
        self.items_read = 0;
        self.blocks_read = 0;
        self.prev_last_item.clear();
    }

    fn next_block(&mut self, ib: &mut InMemoryBlock) -> Result<bool> {
        loop {
            if let Some(index) = &self.index {
                if self.bh_idx < index.bhs.len() {
                    break;
                }
                self.index = None;
                self.mr_idx += 1;
                self.bh_idx = 0;
            }
            let Some(mr) = self.part.metaindex().get(self.mr_idx) else {
                return self.check_totals().map(|_| false);
            };
            self.index = Some(self.part.read_index_block(mr)?);
        }
        let Some(index) = &self.index else {
            return Ok(false);
        };
        let bh = &index.bhs[self.bh_idx];
        self.part.read_block(bh, &mut self.sb, ib)?;
        self.bh_idx += 1;

        let first = ib.item(0);
        if self.blocks_read > 0 && first < self.prev_last_item.as_slice() {
            return Err(Error::Validation(format!(
                "block #{} starts with {first:?}, below the last item {:?} of the previous block",
                self.blocks_read, self.prev_last_item
            )));
        }
        self.prev_last_item.clear();
        self.prev_last_item
            .extend_from_slice(ib.item(ib.len() - 1));
        self.items_read += ib.len() as u64;
        self.blocks_read += 1;
        Ok(true)
    }

    fn check_totals(&self) -> Result<()> {
        let ph = self.part.header();
        if self.items_read != ph.items_count || self.blocks_read != ph.blocks_count {
            return Err(Error::Validation(format!(
                "read {} items in {} blocks; the part header promises {} items in {} blocks",
                self.items_read, self.blocks_read, ph.items_count, ph.blocks_count
            )));
        }
        Ok(())
    }
}

/// Yields the blocks of a part, or of a single in-memory block, in order.
pub struct BlockStreamReader {
    pub(crate) block: InMemoryBlock,
    pub(crate) curr_item_idx: usize,
    source: Source,
}

impl BlockStreamReader {
    /// Reads a single block. Its items are sorted here.
    pub fn from_inmemory_block(mut ib: InMemoryBlock) -> Self {
        ib.sort_items();
        Self {
            block: ib,
            curr_item_idx: 0,
            source: Source::InMemory { yielded: false },
        }
    }

    pub fn from_part(part: Arc<Part>) -> Self {
        Self {
            block: InMemoryBlock::new(),
            curr_item_idx: 0,
            source: Source::Part(Box::new(PartCursor::new(part))),
        }
    }

    /// The block currently loaded by [`BlockStreamReader::next_block`].
    pub fn block(&self) -> &InMemoryBlock {
        &self.block
    }

    pub fn current_item(&self) -> &[u8] {
        self.block.item(self.curr_item_idx)
    }

    /// Loads the next block. Returns false once the stream is exhausted.
    pub fn next_block(&mut self) -> Result<bool> {
        self.curr_item_idx = 0;
        match &mut self.source {
            Source::InMemory { yielded } => {
                if *yielded || self.block.is_empty() {
                    return Ok(false);
                }
                *yielded = true;
                Ok(true)
            }
            Source::Part(cursor) => {
                let loaded = cursor.next_block(&mut self.block)?;
                if !loaded {
                    self.block.reset();
                }
                Ok(loaded)
            }
        }
    }

    /// Restarts the stream from its first block.
    pub fn reset(&mut self) {
        self.curr_item_idx = 0;
        match &mut self.source {
            Source::InMemory { yielded } => *yielded = false,
            Source::Part(cursor) => {
                cursor.reset();
                self.block.reset();
            }
        }
    }
}
