use std::time::{Duration, Instant};

use crate::block::InMemoryBlock;

/// Items added to the table that are not searchable yet.
pub(crate) struct RawItemsShard {
    blocks: Vec<InMemoryBlock>,
    last_flush: Instant,
}

impl RawItemsShard {
    pub(crate) fn new() -> Self {
        Self {
            blocks: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    /// Appends `items`, opening new blocks of `max_block_size` bytes as needed.
    /// Every item must fit into an empty block.
    ///
    /// Returns the buffered blocks once there are at least `max_blocks` of them.
    pub(crate) fn add_items<T: AsRef<[u8]>>(
        &mut self,
        items: &[T],
        max_block_size: usize,
        max_blocks: usize,
    ) -> Option<Vec<InMemoryBlock>> {
        for item in items {
            let item = item.as_ref();
            let added = self.blocks.last_mut().is_some_and(|ib| ib.add(item));
            if !added {
                let mut ib = InMemoryBlock::with_max_size(max_block_size);
                let fits = ib.add(item);
                debug_assert!(fits, "item of {} bytes does not fit a block", item.len());
                self.blocks.push(ib);
            }
        }
        if self.blocks.len() >= max_blocks {
            return Some(self.take_blocks());
        }
        None
    }

    /// Hands out the buffered blocks if the last flush happened at least
    /// `interval` ago, or unconditionally when `interval` is `None`.
    pub(crate) fn flush(&mut self, interval: Option<Duration>) -> Vec<InMemoryBlock> {
        if interval.is_some_and(|interval| self.last_flush.elapsed() < interval) {
            return Vec::new();
        }
        self.take_blocks()
    }

    pub(crate) fn pending_items(&self) -> usize {
        self.blocks.iter().map(|ib| ib.len()).sum()
    }

    fn take_blocks(&mut self) -> Vec<InMemoryBlock> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.blocks)
    }
}
