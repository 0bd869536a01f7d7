use std::path::{Component, Path, PathBuf};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fs::filename::{txn_path, TXN_DIR};
use crate::fs::{remove_dir_sync, sync_dir, write_file_sync};

/// A durable record of a merge, written before its output is renamed into
/// place. Paths are relative to the table directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MergeTxn {
    pub(crate) merge_idx: u64,
    pub(crate) tmp_part: String,
    /// `None` when the merge produced no items.
    pub(crate) dst_part: Option<String>,
    /// File parts replaced by the merge output.
    pub(crate) superseded: Vec<String>,
}

/// The on-disk transaction record. Removed from disk when dropped.
#[derive(Debug)]
pub(crate) struct MergeTxnFile {
    path: PathBuf,
}

impl MergeTxnFile {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MergeTxnFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::error!("cannot remove merge txn {}: {}", self.path.display(), e);
            }
        }
    }
}

fn table_entry(table: &Path, name: &str) -> Result<PathBuf> {
    let rel = Path::new(name);
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(Error::Validation(format!(
            "merge txn references a path outside the table: {name:?}"
        )));
    }
    Ok(table.join(rel))
}

impl MergeTxn {
    /// Writes the record into `txn/<merge_idx>` and fsyncs it.
    pub(crate) fn write(&self, table: &Path) -> Result<MergeTxnFile> {
        let mut record = serde_json::to_vec(self)?;
        let checksum = crc32fast::hash(&record);
        record.put_u32(checksum);
        // Dropping the handle on failure removes a partially written record.
        let file = MergeTxnFile {
            path: txn_path(table, self.merge_idx),
        };
        write_file_sync(&file.path, &record)?;
        sync_dir(table.join(TXN_DIR))?;
        Ok(file)
    }

    /// Reads a record. Returns `None` if the checksum does not match, which
    /// means the write was interrupted before anything acted on it.
    pub(crate) fn read(path: &Path) -> Result<Option<Self>> {
        let data = std::fs::read(path)?;
        if data.len() < 4 {
            return Ok(None);
        }
        let (record, mut checksum) = data.split_at(data.len() - 4);
        if crc32fast::hash(record) != checksum.get_u32() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(record)?))
    }

    /// Finishes the merge on disk. Safe to apply more than once.
    pub(crate) fn apply(&self, table: &Path) -> Result<()> {
        let tmp = table_entry(table, &self.tmp_part)?;
        if let Some(dst) = &self.dst_part {
            if !tmp.exists() && !table_entry(table, dst)?.exists() {
                // The output never made it: keep the sources.
                log::warn!(
                    "merge txn {:016X} has no output part; keeping its sources",
                    self.merge_idx
                );
                return Ok(());
            }
        }
        if tmp.exists() {
            match &self.dst_part {
                Some(dst) => {
                    let dst = table_entry(table, dst)?;
                    if dst.exists() {
                        remove_dir_sync(&tmp)?;
                    } else {
                        std::fs::rename(&tmp, &dst)?;
                    }
                }
                None => remove_dir_sync(&tmp)?,
            }
        }
        for name in &self.superseded {
            remove_dir_sync(&table_entry(table, name)?)?;
        }
        sync_dir(table)
    }
}

/// Replays every pending merge transaction of the table in merge order and
/// removes the records.
pub(crate) fn replay_txns(table: &Path) -> Result<()> {
    let dir = table.join(TXN_DIR);
    std::fs::create_dir_all(&dir)?;
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    for path in paths {
        match MergeTxn::read(&path)? {
            Some(txn) => {
                txn.apply(table)?;
                log::info!(
                    "replayed merge txn {:016X} replacing {} parts",
                    txn.merge_idx,
                    txn.superseded.len()
                );
            }
            None => log::warn!("discarded corrupted merge txn {}", path.display()),
        }
        std::fs::remove_file(&path)?;
    }
    sync_dir(&dir)
}
