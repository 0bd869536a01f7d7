mod compact;
mod part_wrapper;
mod search;
mod shard;
pub(crate) mod txn;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
pub use search::TableSearch;

use crate::block::InMemoryBlock;
use crate::error::{Error, Result};
use crate::fs::filename::{TMP_DIR, TXN_DIR};
use crate::fs::{clear_dir, sync_dir};
use crate::merge::{merge_block_streams, PrepareBlockFn};
use crate::options::TableOptions;
use crate::part::{InMemoryPart, Part, PartHeader};
use crate::stream::{BlockStreamReader, BlockStreamWriter};
use part_wrapper::PartWrapper;
use shard::RawItemsShard;

/// A point-in-time summary of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub parts: usize,
    pub in_memory_parts: usize,
    pub file_parts: usize,
    /// Items in published parts.
    pub items: u64,
    pub blocks: u64,
    pub size_bytes: u64,
    /// Items added but not searchable yet.
    pub pending_items: u64,
    pub items_merged: u64,
    pub merges_completed: u64,
}

pub(crate) struct TableInner {
    path: PathBuf,
    pub(crate) options: Arc<TableOptions>,
    pub(crate) parts: RwLock<Vec<Arc<PartWrapper>>>,
    shards: Vec<Mutex<RawItemsShard>>,
    shard_idx: AtomicUsize,
    merge_idx: AtomicU64,
    prepare_block: RwLock<Option<PrepareBlockFn>>,
    items_merged: AtomicU64,
    merges_completed: AtomicU64,
    /// Items taken out of the shards whose part is not published yet.
    raw_items_in_flight: AtomicU64,
    /// Held shared while raw blocks are taken and merged; `close` takes it
    /// exclusively so that no accepted item is published after persisting.
    raw_merges: RwLock<()>,
    /// Wakes the merge thread up after new parts are published.
    merge_notifier: crossbeam_channel::Sender<()>,
    closed: AtomicBool,
}

/// A sorted multiset of byte strings stored as a set of immutable parts in a
/// directory.
pub struct Table {
    pub(crate) inner: Arc<TableInner>,
    /// Dropping the sender stops the background threads.
    stop_notifier: Mutex<Option<crossbeam_channel::Sender<()>>>,
    flush_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    merge_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("cannot close table {}: {}", self.inner.path.display(), e);
        }
    }
}

impl Table {
    /// Opens the table stored in `path`, creating the directory if needed,
    /// and starts the background threads.
    pub fn open(path: impl AsRef<Path>, options: TableOptions) -> Result<Arc<Self>> {
        options.validate()?;
        let (merge_tx, merge_rx) = crossbeam_channel::bounded(1);
        let inner = Arc::new(TableInner::open(path.as_ref(), options, merge_tx)?);
        let (stop_tx, stop_rx) = crossbeam_channel::unbounded();
        let flush_thread = inner.spawn_flush_thread(stop_rx.clone())?;
        let merge_thread = inner.spawn_merge_thread(merge_rx, stop_rx)?;
        Ok(Arc::new(Self {
            inner,
            stop_notifier: Mutex::new(Some(stop_tx)),
            flush_thread: Mutex::new(flush_thread),
            merge_thread: Mutex::new(merge_thread),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Adds a batch of items. They become searchable after the next flush of
    /// pending items.
    pub fn add_items<T: AsRef<[u8]>>(&self, items: &[T]) -> Result<()> {
        self.inner.add_items(items)
    }

    /// Installs the callback applied to every block produced by later merges.
    pub fn set_prepare_block(&self, prepare_block: PrepareBlockFn) {
        *self.inner.prepare_block.write() = Some(prepare_block);
    }

    /// Makes every item added so far searchable.
    pub fn flush_pending_items(&self) -> Result<()> {
        self.inner.flush_pending_items(None)
    }

    /// Flushes pending items, then merges every part that is not in a merge
    /// already into a single file part.
    pub fn force_merge_all(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.flush_pending_items(None)?;
        self.inner.force_merge_all()
    }

    pub fn stats(&self) -> TableStats {
        self.inner.stats()
    }

    /// Stops the background threads and persists every item added so far into
    /// file parts. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_notifier.lock().take();

        for guard in [&self.flush_thread, &self.merge_thread] {
            if let Some(thread) = guard.lock().take() {
                if thread.join().is_err() {
                    log::error!("background thread of {} panicked", self.inner.path.display());
                }
            }
        }

        {
            // Waits for raw merges of concurrent `add_items` calls.
            let _merges = self.inner.raw_merges.write();
            self.inner.flush_shards(None)?;
        }
        self.inner.persist_inmemory_parts()?;
        sync_dir(&self.inner.path)
    }
}

impl TableInner {
    fn open(
        path: &Path,
        options: TableOptions,
        merge_notifier: crossbeam_channel::Sender<()>,
    ) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        log::debug!("open table: '{:?}'", path);
        txn::replay_txns(path)?;
        clear_dir(&path.join(TMP_DIR))?;

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if name == TMP_DIR || name == TXN_DIR {
                continue;
            }
            dirs.push(entry.path());
        }
        dirs.sort();

        let mut max_merge_idx = 0;
        let mut parts = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let part = Part::open(&dir, options.index_cache_capacity)?;
            if let Some(idx) = dir
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(PartHeader::parse_merge_idx)
            {
                max_merge_idx = max_merge_idx.max(idx);
            }
            parts.push(Arc::new(PartWrapper::new(Arc::new(part))));
        }
        log::info!("opened table {} with {} parts", path.display(), parts.len());

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let shards = (0..options.shards)
            .map(|_| Mutex::new(RawItemsShard::new()))
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            options: Arc::new(options),
            parts: RwLock::new(parts),
            shards,
            shard_idx: AtomicUsize::new(0),
            merge_idx: AtomicU64::new(now.max(max_merge_idx.saturating_add(1))),
            prepare_block: RwLock::new(None),
            items_merged: AtomicU64::new(0),
            merges_completed: AtomicU64::new(0),
            raw_items_in_flight: AtomicU64::new(0),
            raw_merges: RwLock::new(()),
            merge_notifier,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn next_merge_idx(&self) -> u64 {
        self.merge_idx.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn prepare_block(&self) -> Option<PrepareBlockFn> {
        self.prepare_block.read().clone()
    }

    fn add_items<T: AsRef<[u8]>>(&self, items: &[T]) -> Result<()> {
        let max = self.options.max_block_size;
        if let Some(item) = items.iter().find(|item| item.as_ref().len() > max) {
            return Err(Error::ItemTooLarge {
                len: item.as_ref().len(),
                max,
            });
        }
        let _merges = self.raw_merges.read();
        let idx = self.shard_idx.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let blocks = {
            let mut shard = self.shards[idx].lock();
            self.check_open()?;
            let blocks = shard.add_items(items, max, self.options.max_blocks_per_shard);
            if let Some(blocks) = &blocks {
                self.mark_in_flight(blocks);
            }
            blocks
        };
        match blocks {
            Some(blocks) => self.merge_raw_blocks(blocks),
            None => Ok(()),
        }
    }

    /// Hands the pending blocks of every shard over to merging. With an
    /// interval only shards not flushed for that long are flushed.
    fn flush_pending_items(&self, interval: Option<Duration>) -> Result<()> {
        let _merges = self.raw_merges.read();
        self.check_open()?;
        self.flush_shards(interval)
    }

    fn flush_shards(&self, interval: Option<Duration>) -> Result<()> {
        let mut blocks = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            let mut flushed = shard.flush(interval);
            self.mark_in_flight(&flushed);
            blocks.append(&mut flushed);
        }
        self.merge_raw_blocks(blocks)
    }

    fn mark_in_flight(&self, blocks: &[InMemoryBlock]) {
        let n: usize = blocks.iter().map(InMemoryBlock::len).sum();
        self.raw_items_in_flight.fetch_add(n as u64, Ordering::SeqCst);
    }

    /// Turns raw blocks into in-memory parts, merging up to `parts_to_merge`
    /// blocks per part on parallel threads, and publishes the parts.
    ///
    /// The blocks must have been counted by `mark_in_flight`.
    fn merge_raw_blocks(&self, blocks: Vec<InMemoryBlock>) -> Result<()> {
        let in_flight: usize = blocks.iter().map(InMemoryBlock::len).sum();
        let res = self.merge_and_publish(blocks);
        self.raw_items_in_flight.fetch_sub(in_flight as u64, Ordering::SeqCst);
        res
    }

    fn merge_and_publish(&self, blocks: Vec<InMemoryBlock>) -> Result<()> {
        let mut blocks: Vec<_> = blocks.into_iter().filter(|ib| !ib.is_empty()).collect();
        if blocks.is_empty() {
            return Ok(());
        }
        let mut chunks = Vec::new();
        while !blocks.is_empty() {
            let rest = blocks.split_off(blocks.len().min(self.options.parts_to_merge));
            chunks.push(std::mem::replace(&mut blocks, rest));
        }

        let results: Vec<Result<Option<Part>>> = std::thread::scope(|s| {
            let handles: Vec<_> = chunks
                .into_iter()
                .map(|chunk| s.spawn(move || self.merge_inmemory_blocks(chunk)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });

        let mut new_parts = Vec::with_capacity(results.len());
        let mut first_err = None;
        for result in results {
            match result {
                Ok(Some(part)) => new_parts.push(Arc::new(PartWrapper::new(Arc::new(part)))),
                Ok(None) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if !new_parts.is_empty() {
            self.parts.write().append(&mut new_parts);
            self.merge_notifier.try_send(()).ok();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn merge_inmemory_blocks(&self, mut blocks: Vec<InMemoryBlock>) -> Result<Option<Part>> {
        let level = self.options.compress_level;
        let cache_capacity = self.options.index_cache_capacity;
        if blocks.len() == 1 {
            let mut ib = blocks.remove(0);
            let mp = InMemoryPart::from_block(&mut ib, level)?;
            return Part::from_inmemory(mp, cache_capacity).map(Some);
        }

        let bsrs = blocks
            .into_iter()
            .map(BlockStreamReader::from_inmemory_block)
            .collect();
        let mut bsw = BlockStreamWriter::new_in_memory(level);
        let mut ph = PartHeader::default();
        merge_block_streams(
            &mut ph,
            &mut bsw,
            bsrs,
            self.prepare_block(),
            None,
            &self.items_merged,
        )?;
        if ph.items_count == 0 {
            return Ok(None);
        }
        let mp = InMemoryPart::from_streams(ph, bsw.finish()?);
        Part::from_inmemory(mp, cache_capacity).map(Some)
    }

    fn trigger_flush(&self) -> Result<()> {
        let interval = Duration::from_millis(self.options.flush_interval_ms);
        match self.flush_pending_items(Some(interval)) {
            Err(Error::Closed) => Ok(()),
            res => res,
        }
    }

    fn spawn_flush_thread(
        self: &Arc<Self>,
        rx: crossbeam_channel::Receiver<()>,
    ) -> Result<Option<std::thread::JoinHandle<()>>> {
        let this = self.clone();
        let interval = Duration::from_millis(self.options.flush_interval_ms);
        let handle = std::thread::Builder::new()
            .name("mergeset-flush".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => if let Err(e) = this.trigger_flush() {
                            log::error!("cannot flush pending items: {}", e);
                        },
                        recv(rx) -> _ => return
                    }
                }
            })?;
        Ok(Some(handle))
    }

    fn stats(&self) -> TableStats {
        let mut stats = TableStats::default();
        for pw in self.parts.read().iter() {
            let part = &pw.part;
            stats.parts += 1;
            if part.is_in_memory() {
                stats.in_memory_parts += 1;
            } else {
                stats.file_parts += 1;
            }
            stats.items += part.header().items_count;
            stats.blocks += part.header().blocks_count;
            stats.size_bytes += part.size();
        }
        stats.pending_items = self
            .shards
            .iter()
            .map(|shard| shard.lock().pending_items() as u64)
            .sum::<u64>()
            + self.raw_items_in_flight.load(Ordering::SeqCst);
        stats.items_merged = self.items_merged.load(Ordering::Relaxed);
        stats.merges_completed = self.merges_completed.load(Ordering::Relaxed);
        stats
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn options() -> TableOptions {
        TableOptions {
            enable_background_merge: false,
            flush_interval_ms: 60_000,
            ..TableOptions::default_for_test()
        }
    }

    fn collect_all(table: &Table) -> Vec<Vec<u8>> {
        let mut ts = TableSearch::new(table);
        ts.seek(b"").unwrap();
        let mut items = Vec::new();
        while ts.next_item().unwrap() {
            items.push(ts.item().to_vec());
        }
        items
    }

    #[test]
    fn test_add_and_flush() {
        let dir = tempdir().unwrap();
        let table = Table::open(dir.path(), options()).unwrap();
        table.add_items(&[b"b", b"a"]).unwrap();
        table.add_items(&[b"c"]).unwrap();
        assert_eq!(table.stats().pending_items, 3);
        assert!(collect_all(&table).is_empty());

        table.flush_pending_items().unwrap();
        let stats = table.stats();
        assert_eq!(stats.pending_items, 0);
        assert_eq!(stats.items, 3);
        assert_eq!(stats.in_memory_parts, stats.parts);
        assert_eq!(collect_all(&table), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_shard_threshold_publishes_parts() {
        let dir = tempdir().unwrap();
        let options = TableOptions {
            shards: 1,
            max_blocks_per_shard: 2,
            max_block_size: 64,
            ..options()
        };
        let table = Table::open(dir.path(), options).unwrap();
        let items: Vec<Vec<u8>> = (0..8u32).map(|i| format!("item-{i:027}").into_bytes()).collect();
        // 32-byte items, two per 64-byte block: the third item opens the second block.
        table.add_items(&items[..3]).unwrap();
        assert_eq!(table.stats().parts, 1);
        assert_eq!(table.stats().pending_items, 0);
        table.add_items(&items[3..]).unwrap();
        assert_eq!(collect_all(&table), items);
    }

    #[test]
    fn test_in_flight_items_are_pending() {
        let dir = tempdir().unwrap();
        let table = Table::open(dir.path(), options()).unwrap();
        let mut ib = InMemoryBlock::new();
        assert!(ib.add(b"b"));
        assert!(ib.add(b"a"));
        let blocks = vec![ib];
        table.inner.mark_in_flight(&blocks);
        let stats = table.stats();
        assert_eq!((stats.pending_items, stats.items), (2, 0));

        table.inner.merge_raw_blocks(blocks).unwrap();
        let stats = table.stats();
        assert_eq!((stats.pending_items, stats.items), (0, 2));
        assert_eq!(collect_all(&table), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_item_too_large() {
        let dir = tempdir().unwrap();
        let table = Table::open(dir.path(), options()).unwrap();
        let big = vec![0u8; 4097];
        let err = table.add_items(&[b"ok".to_vec(), big]).unwrap_err();
        assert!(matches!(err, Error::ItemTooLarge { len: 4097, max: 4096 }));
        assert_eq!(table.stats().pending_items, 0);
    }

    #[test]
    fn test_closed_table() {
        let dir = tempdir().unwrap();
        let table = Table::open(dir.path(), options()).unwrap();
        table.add_items(&[b"x"]).unwrap();
        table.close().unwrap();
        table.close().unwrap();
        assert!(matches!(table.add_items(&[b"y"]), Err(Error::Closed)));
        assert!(matches!(table.flush_pending_items(), Err(Error::Closed)));
        let stats = table.stats();
        assert_eq!((stats.file_parts, stats.in_memory_parts, stats.items), (1, 0, 1));
    }

    #[test]
    fn test_reopen_sees_items() {
        let dir = tempdir().unwrap();
        {
            let table = Table::open(dir.path(), options()).unwrap();
            table.add_items(&[b"k2", b"k1"]).unwrap();
            table.flush_pending_items().unwrap();
            table.add_items(&[b"k3"]).unwrap();
        }
        let table = Table::open(dir.path(), options()).unwrap();
        assert_eq!(
            collect_all(&table),
            vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()]
        );
        assert!(dir.path().join(TMP_DIR).exists());
        assert!(dir.path().join(TXN_DIR).exists());
        assert_eq!(std::fs::read_dir(dir.path().join(TXN_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_open_fails_on_corrupted_part() {
        let dir = tempdir().unwrap();
        {
            let table = Table::open(dir.path(), options()).unwrap();
            table.add_items(&[b"a"]).unwrap();
        }
        let part_dir = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.file_name().is_some_and(|n| n != TMP_DIR && n != TXN_DIR))
            .unwrap();
        std::fs::write(part_dir.join("metaindex.bin"), b"garbage").unwrap();
        assert!(Table::open(dir.path(), options()).is_err());
    }

    #[test]
    fn test_prepare_block_applies_to_merges() {
        let dir = tempdir().unwrap();
        let table = Table::open(dir.path(), options()).unwrap();
        table.set_prepare_block(Arc::new(|data: Vec<u8>, items: Vec<crate::block::Item>| {
            let mut kept: Vec<crate::block::Item> = Vec::with_capacity(items.len());
            for item in items {
                if kept.last().is_some_and(|last| last.bytes(&data) == item.bytes(&data)) {
                    continue;
                }
                kept.push(item);
            }
            (data, kept)
        }));
        for _ in 0..3 {
            table.add_items(&[&b"dup"[..], b"other"]).unwrap();
            table.flush_pending_items().unwrap();
        }
        table.force_merge_all().unwrap();
        assert_eq!(collect_all(&table), vec![b"dup".to_vec(), b"other".to_vec()]);
        assert_eq!(table.stats().merges_completed, 1);
    }
}
