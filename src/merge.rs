use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::block::{InMemoryBlock, Item};
use crate::error::{Error, Result};
use crate::part::PartHeader;
use crate::stream::{BlockStreamReader, BlockStreamWriter, StreamSink};

/// Rewrites every block produced by a merge right before it is written.
///
/// It receives the backing buffer and the sorted items of the block and returns
/// a possibly changed pair. The returned items must stay sorted and point inside
/// the returned buffer. Returning no items drops the block.
pub type PrepareBlockFn = Arc<dyn Fn(Vec<u8>, Vec<Item>) -> (Vec<u8>, Vec<Item>) + Send + Sync>;

/// Merges the items of `bsrs` into `bsw` in sorted order and accumulates the
/// stats of the written blocks into `ph`.
///
/// `stop` is polled once per merge step. A message or a dropped sender cancels
/// the merge with [`Error::Cancelled`], leaving `bsw` with partial output.
pub fn merge_block_streams<W: StreamSink>(
    ph: &mut PartHeader,
    bsw: &mut BlockStreamWriter<W>,
    bsrs: Vec<BlockStreamReader>,
    prepare_block: Option<PrepareBlockFn>,
    stop: Option<&Receiver<()>>,
    items_merged: &AtomicU64,
) -> Result<()> {
    let mut bsm = BlockStreamMerger::new(prepare_block);
    bsm.init(bsrs)?;
    bsm.merge(bsw, ph, stop, items_merged)
}

struct BlockStreamMerger {
    heap: Vec<BlockStreamReader>,
    out: OutputBlock,
}

struct OutputBlock {
    ib: InMemoryBlock,
    ph_first_item_caught: bool,
    prepare_block: Option<PrepareBlockFn>,
}

pub(crate) fn is_stopped(stop: Option<&Receiver<()>>) -> bool {
    stop.is_some_and(|rx| matches!(rx.try_recv(), Ok(()) | Err(TryRecvError::Disconnected)))
}

impl BlockStreamMerger {
    fn new(prepare_block: Option<PrepareBlockFn>) -> Self {
        Self {
            heap: Vec::new(),
            out: OutputBlock {
                ib: InMemoryBlock::new(),
                ph_first_item_caught: false,
                prepare_block,
            },
        }
    }

    fn init(&mut self, bsrs: Vec<BlockStreamReader>) -> Result<()> {
        for mut bsr in bsrs {
            if bsr.next_block()? {
                self.heap.push(bsr);
            }
        }
        for i in (0..self.heap.len() / 2).rev() {
            self.sift_down(i);
        }
        Ok(())
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.heap[i].current_item() < self.heap[j].current_item()
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            if left >= n {
                return;
            }
            let mut child = left;
            if left + 1 < n && self.less(left + 1, left) {
                child = left + 1;
            }
            if !self.less(child, i) {
                return;
            }
            self.heap.swap(i, child);
            i = child;
        }
    }

    fn pop_root(&mut self) {
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        self.heap.pop();
        self.sift_down(0);
    }

    fn merge<W: StreamSink>(
        &mut self,
        bsw: &mut BlockStreamWriter<W>,
        ph: &mut PartHeader,
        stop: Option<&Receiver<()>>,
        items_merged: &AtomicU64,
    ) -> Result<()> {
        loop {
            if is_stopped(stop) {
                return Err(Error::Cancelled);
            }
            let Some((root, rest)) = self.heap.split_first_mut() else {
                return self.out.flush(bsw, ph, items_merged);
            };

            // The smallest item among the other readers sits in one of the
            // root's children.
            let next_item = match rest {
                [] => None,
                [a] => Some(a.current_item()),
                [a, b, ..] => Some(a.current_item().min(b.current_item())),
            };
            while root.curr_item_idx < root.block.len() {
                let item = root.block.item(root.curr_item_idx);
                if next_item.is_some_and(|next| item > next) {
                    break;
                }
                if !self.out.ib.add(item) {
                    if self.out.ib.is_empty() {
                        return Err(Error::ItemTooLarge {
                            len: item.len(),
                            max: self.out.ib.max_size(),
                        });
                    }
                    self.out.flush(bsw, ph, items_merged)?;
                    continue;
                }
                root.curr_item_idx += 1;
            }

            if root.curr_item_idx == root.block.len() && !root.next_block()? {
                self.pop_root();
            } else {
                self.sift_down(0);
            }
        }
    }
}

impl OutputBlock {
    fn flush<W: StreamSink>(
        &mut self,
        bsw: &mut BlockStreamWriter<W>,
        ph: &mut PartHeader,
        items_merged: &AtomicU64,
    ) -> Result<()> {
        if self.ib.is_empty() {
            return Ok(());
        }
        if let Some(prepare_block) = &self.prepare_block {
            let max_size = self.ib.max_size();
            let (data, items) = self.ib.take_raw();
            let (data, items) = prepare_block(data, items);
            self.ib = InMemoryBlock::from_raw(data, items, max_size)?;
            if !self.ib.is_sorted() {
                return Err(Error::Validation(
                    "prepare block callback returned unsorted items".to_string(),
                ));
            }
            if self.ib.is_empty() {
                self.ib.reset();
                return Ok(());
            }
        }

        let first = self.ib.item(0);
        if self.ph_first_item_caught && first < ph.last_item.as_slice() {
            return Err(Error::Validation(format!(
                "block starting with {first:?} is below the last written item {:?}",
                ph.last_item
            )));
        }
        let n = self.ib.len() as u64;
        if !self.ph_first_item_caught {
            ph.first_item.clear();
            ph.first_item.extend_from_slice(first);
            self.ph_first_item_caught = true;
        }
        ph.last_item.clear();
        ph.last_item.extend_from_slice(self.ib.item(self.ib.len() - 1));

        bsw.write_block(&mut self.ib)?;
        ph.items_count += n;
        ph.blocks_count += 1;
        items_merged.fetch_add(n, Ordering::Relaxed);
        self.ib.reset();
        Ok(())
    }
}
