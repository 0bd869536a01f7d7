use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::txn::MergeTxnFile;
use crate::fs::remove_dir_sync;
use crate::part::Part;

/// A part published in the table together with its lifetime bookkeeping.
///
/// The table holds one reference while the part is live; every search holds
/// another one. A part retired by a merge is deleted from disk once the last
/// reference is released.
pub(crate) struct PartWrapper {
    pub(crate) part: Arc<Part>,
    ref_count: AtomicU64,
    must_drop: AtomicBool,
    /// Set while a merge owns the part as one of its sources.
    pub(crate) in_merge: AtomicBool,
    /// Keeps the merge transaction that retired this part on disk until the
    /// part directory is gone.
    txn: Mutex<Option<Arc<MergeTxnFile>>>,
}

impl PartWrapper {
    pub(crate) fn new(part: Arc<Part>) -> Self {
        Self {
            part,
            ref_count: AtomicU64::new(1),
            must_drop: AtomicBool::new(false),
            in_merge: AtomicBool::new(false),
            txn: Mutex::new(None),
        }
    }

    pub(crate) fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "part reference count underflow");
        if prev != 1 {
            return;
        }
        if self.must_drop.load(Ordering::Acquire) {
            if let Some(path) = self.part.path() {
                match remove_dir_sync(path) {
                    Ok(()) => log::info!("deleted part {}", path.display()),
                    Err(e) => log::error!("cannot delete part {}: {}", path.display(), e),
                }
            }
        }
        self.txn.lock().take();
    }

    /// Marks the part as superseded and releases the table reference.
    pub(crate) fn retire(&self, txn: &Arc<MergeTxnFile>) {
        if self.part.path().is_some() {
            *self.txn.lock() = Some(txn.clone());
        }
        self.must_drop.store(true, Ordering::Release);
        self.dec_ref();
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::block::InMemoryBlock;
    use crate::part::PartHeader;
    use crate::stream::BlockStreamWriter;
    use crate::table::txn::MergeTxn;

    fn file_part(dir: &std::path::Path) -> Arc<Part> {
        let tmp = dir.join("building");
        let mut ib = InMemoryBlock::new();
        assert!(ib.add(b"a"));
        assert!(ib.add(b"b"));
        let mut writer = BlockStreamWriter::create_file_part(&tmp, 0).unwrap();
        writer.write_block(&mut ib).unwrap();
        writer.finish().unwrap();
        let ph = PartHeader {
            items_count: 2,
            blocks_count: 1,
            first_item: b"a".to_vec(),
            last_item: b"b".to_vec(),
        };
        ph.write_metadata(&tmp).unwrap();
        let dst = dir.join(ph.dir_name(7));
        std::fs::rename(&tmp, &dst).unwrap();
        Arc::new(Part::open(&dst, 4).unwrap())
    }

    #[test]
    fn test_retired_part_deleted_after_last_reference() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("txn")).unwrap();
        let part = file_part(dir.path());
        let part_dir = part.path().unwrap().to_path_buf();
        let pw = PartWrapper::new(part);

        let txn = MergeTxn {
            merge_idx: 9,
            tmp_part: "tmp/0000000000000009".to_string(),
            dst_part: None,
            superseded: vec!["2_1_0000000000000007".to_string()],
        };
        let txn_file = Arc::new(txn.write(dir.path()).unwrap());
        let txn_path = txn_file.path().to_path_buf();

        pw.inc_ref();
        pw.retire(&txn_file);
        drop(txn_file);
        assert_eq!(pw.ref_count(), 1);
        assert!(part_dir.exists());
        assert!(txn_path.exists());

        pw.dec_ref();
        assert!(!part_dir.exists());
        assert!(!txn_path.exists());
    }

    #[test]
    fn test_live_part_kept() {
        let dir = tempdir().unwrap();
        let part = file_part(dir.path());
        let part_dir = part.path().unwrap().to_path_buf();
        let pw = PartWrapper::new(part);
        pw.inc_ref();
        pw.dec_ref();
        assert_eq!(pw.ref_count(), 1);
        assert!(part_dir.exists());
    }
}
