use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use super::part_wrapper::PartWrapper;
use super::txn::MergeTxn;
use super::TableInner;
use crate::error::{Error, Result};
use crate::fs::filename::{tmp_part_path, TMP_DIR};
use crate::fs::{remove_dir_sync, sync_dir};
use crate::merge::{is_stopped, merge_block_streams};
use crate::part::{Part, PartHeader};
use crate::stream::{BlockStreamReader, BlockStreamWriter};

/// Picks the parts for the next background merge out of `sizes`, returning
/// their indexes.
///
/// Windows of parts adjacent in size order are scored by their total size over
/// the size of their largest part. The best window wins if it scores at least
/// half of `max_parts`, so a merge always combines parts of comparable size
/// and the output grows geometrically.
pub(crate) fn pick_parts_to_merge(sizes: &[u64], max_parts: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by_key(|&i| sizes[i]);
    let min_score = (max_parts as f64 / 2.0).max(1.7);
    let max_parts = max_parts.min(order.len());

    let mut best: Option<(f64, &[usize])> = None;
    for len in (2..=max_parts).rev() {
        for window in order.windows(len) {
            let smallest = sizes[window[0]].max(1);
            let largest = sizes[window[len - 1]].max(1);
            // A part larger than all the others together is not worth rewriting.
            if smallest.saturating_mul(len as u64) < largest {
                continue;
            }
            let total: u64 = window.iter().map(|&i| sizes[i].max(1)).sum();
            let score = total as f64 / largest as f64;
            if best.map_or(true, |(best_score, _)| score > best_score) {
                best = Some((score, window));
            }
        }
    }
    match best {
        Some((score, window)) if score >= min_score => window.to_vec(),
        _ => Vec::new(),
    }
}

impl TableInner {
    /// Marks the parts chosen by `pick` as in merge and returns them. `pick`
    /// sees the parts not in a merge already.
    fn claim_parts(
        &self,
        pick: impl FnOnce(&[Arc<PartWrapper>]) -> Vec<usize>,
    ) -> Vec<Arc<PartWrapper>> {
        let parts = self.parts.write();
        let candidates: Vec<Arc<PartWrapper>> = parts
            .iter()
            .filter(|pw| !pw.in_merge.load(Ordering::Acquire))
            .cloned()
            .collect();
        let picked: Vec<Arc<PartWrapper>> = pick(&candidates)
            .into_iter()
            .map(|i| candidates[i].clone())
            .collect();
        for pw in &picked {
            pw.in_merge.store(true, Ordering::Release);
        }
        picked
    }

    fn release_parts(pws: &[Arc<PartWrapper>]) {
        for pw in pws {
            pw.in_merge.store(false, Ordering::Release);
        }
    }

    /// Merges `pws` into a new file part and publishes it in place of them.
    /// The parts must be claimed by the caller. On failure they are released
    /// and the live part set stays untouched.
    pub(crate) fn merge_parts(
        &self,
        pws: Vec<Arc<PartWrapper>>,
        stop: Option<&Receiver<()>>,
    ) -> Result<()> {
        let merge_idx = self.next_merge_idx();
        let tmp = tmp_part_path(&self.path, merge_idx);
        let start = Instant::now();
        match self.merge_parts_to(&pws, merge_idx, stop) {
            Ok(dst) => {
                self.merges_completed.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "merged {} parts into {} in {:?}",
                    pws.len(),
                    dst.as_deref().unwrap_or("nothing"),
                    start.elapsed()
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rm_err) = remove_dir_sync(&tmp) {
                    log::error!("cannot remove {}: {}", tmp.display(), rm_err);
                }
                Self::release_parts(&pws);
                Err(e)
            }
        }
    }

    /// Returns the name of the published part, `None` when the merge produced
    /// no items.
    fn merge_parts_to(
        &self,
        pws: &[Arc<PartWrapper>],
        merge_idx: u64,
        stop: Option<&Receiver<()>>,
    ) -> Result<Option<String>> {
        let tmp = tmp_part_path(&self.path, merge_idx);
        let bsrs = pws
            .iter()
            .map(|pw| BlockStreamReader::from_part(pw.part.clone()))
            .collect();
        let mut bsw = BlockStreamWriter::create_file_part(&tmp, self.options.compress_level)?;
        let mut ph = PartHeader::default();
        merge_block_streams(
            &mut ph,
            &mut bsw,
            bsrs,
            self.prepare_block(),
            stop,
            &self.items_merged,
        )?;
        bsw.finish()?;

        let dst_name = (ph.items_count > 0).then(|| ph.dir_name(merge_idx));
        if dst_name.is_some() {
            ph.write_metadata(&tmp)?;
        }
        let txn = MergeTxn {
            merge_idx,
            tmp_part: format!("{TMP_DIR}/{merge_idx:016X}"),
            dst_part: dst_name.clone(),
            superseded: pws
                .iter()
                .filter_map(|pw| pw.part.path())
                .filter_map(|path| path.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
        };
        let txn_file = Arc::new(txn.write(&self.path)?);

        let new_part = match &dst_name {
            Some(name) => {
                let dst = self.path.join(name);
                std::fs::rename(&tmp, &dst)?;
                let opened = sync_dir(&self.path)
                    .and_then(|()| Part::open(&dst, self.options.index_cache_capacity));
                match opened {
                    Ok(part) => Some(Arc::new(PartWrapper::new(Arc::new(part)))),
                    Err(e) => {
                        // Nothing refers to the new part yet: undo the rename
                        // and forget the txn so a restart keeps the sources.
                        remove_dir_sync(&dst)?;
                        return Err(e);
                    }
                }
            }
            None => {
                remove_dir_sync(&tmp)?;
                None
            }
        };

        {
            let mut parts = self.parts.write();
            parts.retain(|pw| !pws.iter().any(|old| Arc::ptr_eq(old, pw)));
            parts.extend(new_part);
        }
        for pw in pws {
            pw.retire(&txn_file);
        }
        Ok(dst_name)
    }

    fn trigger_merge(&self, stop: &Receiver<()>) -> Result<()> {
        let max_parts = self.options.parts_to_merge;
        loop {
            if is_stopped(Some(stop)) {
                return Ok(());
            }
            let pws = self.claim_parts(|candidates| {
                let sizes: Vec<u64> = candidates.iter().map(|pw| pw.part.size()).collect();
                pick_parts_to_merge(&sizes, max_parts)
            });
            if pws.is_empty() {
                return Ok(());
            }
            match self.merge_parts(pws, Some(stop)) {
                Err(Error::Cancelled) => {
                    log::debug!("merge in {} cancelled", self.path.display());
                    return Ok(());
                }
                result => result?,
            }
        }
    }

    fn run_merge(&self, stop: &Receiver<()>) {
        if let Err(e) = self.trigger_merge(stop) {
            log::error!("merge in {} failed: {}", self.path.display(), e);
        }
    }

    pub(crate) fn spawn_merge_thread(
        self: &Arc<Self>,
        notifier: Receiver<()>,
        rx: Receiver<()>,
    ) -> Result<Option<std::thread::JoinHandle<()>>> {
        if !self.options.enable_background_merge {
            return Ok(None);
        }
        let this = self.clone();
        let interval = Duration::from_millis(self.options.merge_interval_ms);
        let handle = std::thread::Builder::new()
            .name("mergeset-merge".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => this.run_merge(&rx),
                        recv(notifier) -> msg => if msg.is_ok() { this.run_merge(&rx) },
                        recv(rx) -> _ => return
                    }
                }
            })?;
        Ok(Some(handle))
    }

    /// Merges every part not in a merge into one file part. A lone file part
    /// is left alone.
    pub(crate) fn force_merge_all(&self) -> Result<()> {
        let pws = self.claim_parts(|candidates| match candidates {
            [] => Vec::new(),
            [only] if !only.part.is_in_memory() => Vec::new(),
            _ => (0..candidates.len()).collect(),
        });
        if pws.is_empty() {
            return Ok(());
        }
        self.merge_parts(pws, None)
    }

    /// Merges all in-memory parts into one file part.
    pub(crate) fn persist_inmemory_parts(&self) -> Result<()> {
        let pws = self.claim_parts(|candidates| {
            (0..candidates.len())
                .filter(|&i| candidates[i].part.is_in_memory())
                .collect()
        });
        if pws.is_empty() {
            return Ok(());
        }
        self.merge_parts(pws, None)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::block::Item;
    use crate::options::TableOptions;
    use crate::table::{Table, TableSearch};

    fn table_with_parts(dir: &std::path::Path) -> Arc<Table> {
        let options = TableOptions {
            enable_background_merge: false,
            flush_interval_ms: 60_000,
            ..TableOptions::default_for_test()
        };
        let table = Table::open(dir, options).unwrap();
        for i in 0..3u32 {
            let items: Vec<Vec<u8>> = (0..100u32)
                .map(|j| format!("{i}-{j:03}").into_bytes())
                .collect();
            table.add_items(&items).unwrap();
            table.flush_pending_items().unwrap();
        }
        table
    }

    fn count_items(table: &Table) -> usize {
        let mut ts = TableSearch::new(table);
        ts.seek(b"").unwrap();
        let mut n = 0;
        while ts.next_item().unwrap() {
            n += 1;
        }
        n
    }

    fn assert_merge_rolled_back(table: &Table, parts_before: usize) {
        let inner = &table.inner;
        assert_eq!(std::fs::read_dir(inner.path.join(TMP_DIR)).unwrap().count(), 0);
        assert_eq!(table.stats().parts, parts_before);
        assert!(inner
            .parts
            .read()
            .iter()
            .all(|pw| !pw.in_merge.load(Ordering::Acquire)));
        assert_eq!(count_items(table), 300);

        let claimed = inner.claim_parts(|candidates| (0..candidates.len()).collect());
        assert_eq!(claimed.len(), parts_before);
        TableInner::release_parts(&claimed);
    }

    #[test]
    fn test_cancelled_merge_keeps_parts() {
        let dir = tempdir().unwrap();
        let table = table_with_parts(dir.path());
        let parts_before = table.stats().parts;
        assert!(parts_before > 1);

        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(()).unwrap();
        let pws = table
            .inner
            .claim_parts(|candidates| (0..candidates.len()).collect());
        let res = table.inner.merge_parts(pws, Some(&rx));
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_merge_rolled_back(&table, parts_before);

        table.force_merge_all().unwrap();
        assert_eq!(table.stats().parts, 1);
        assert_eq!(count_items(&table), 300);
    }

    #[test]
    fn test_failed_merge_keeps_parts() {
        let dir = tempdir().unwrap();
        let table = table_with_parts(dir.path());
        let parts_before = table.stats().parts;

        table.set_prepare_block(Arc::new(|data: Vec<u8>, mut items: Vec<Item>| {
            items.reverse();
            (data, items)
        }));
        assert!(matches!(table.force_merge_all(), Err(Error::Validation(_))));
        assert_merge_rolled_back(&table, parts_before);
    }

    #[test]
    fn test_pick_equal_parts() {
        let sizes = [100; 10];
        let picked = pick_parts_to_merge(&sizes, 15);
        assert_eq!(picked.len(), 10);
        assert!(pick_parts_to_merge(&sizes[..7], 15).is_empty());
        assert_eq!(pick_parts_to_merge(&sizes[..7], 4).len(), 4);
    }

    #[test]
    fn test_pick_skips_huge_part() {
        // The big part is larger than the small ones together.
        let sizes = [10_000, 10, 10, 10, 10];
        let mut picked = pick_parts_to_merge(&sizes, 4);
        picked.sort();
        assert_eq!(picked, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_pick_needs_two_parts() {
        assert!(pick_parts_to_merge(&[], 4).is_empty());
        assert!(pick_parts_to_merge(&[5], 4).is_empty());
        assert_eq!(pick_parts_to_merge(&[5, 5], 2).len(), 2);
    }

    #[test]
    fn test_pick_prefers_balanced_window() {
        let sizes = [1, 1, 1, 1, 1000, 1000, 1000, 1000];
        let mut picked = pick_parts_to_merge(&sizes, 4);
        picked.sort();
        assert_eq!(picked.len(), 4);
        let picked_sizes: Vec<u64> = picked.iter().map(|&i| sizes[i]).collect();
        assert!(picked_sizes.iter().all(|&s| s == picked_sizes[0]));
    }
}
