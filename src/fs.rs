pub mod filename;

use std::fs::File;
use std::io::Write;
use std::path::Path;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Positional reads over an immutable stream of a part.
pub trait ReadAt: Send + Sync {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    fn size(&self) -> u64;
}

/// A read-only file with its size captured on open.
pub struct FileObject {
    file: File,
    size: u64,
}

impl FileObject {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options().read(true).write(false).open(path)?;
        let size = file.metadata()?.len();
        Ok(FileObject { file, size })
    }
}

impl ReadAt for FileObject {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let mut data = vec![0; len];
        self.file.read_exact_at(&mut data[..], offset)?;
        Ok(data)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl ReadAt for Bytes {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        self.get(start..start.saturating_add(len))
            .map(|b| b.to_vec())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("cannot read {len} bytes at offset {offset} from {} bytes", self.len()),
                ))
            })
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}

/// Writes `data` to a new file at `path` and fsyncs it.
pub fn write_file_sync(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

pub fn sync_dir(path: impl AsRef<Path>) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

/// Removes the directory with its contents and fsyncs the parent.
/// A missing directory is not an error.
pub fn remove_dir_sync(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Removes everything inside `path`, creating it when missing.
pub fn clear_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
        return Ok(());
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    sync_dir(path)
}

/// Total size of the regular files directly inside `path`.
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut size = 0;
    for entry in std::fs::read_dir(path)? {
        let meta = entry?.metadata()?;
        if meta.is_file() {
            size += meta.len();
        }
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_file_object() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.bin");
        write_file_sync(&path, b"0123456789").unwrap();
        let file = FileObject::open(&path).unwrap();
        assert_eq!(file.size(), 10);
        assert_eq!(file.read_at(3, 4).unwrap(), b"3456");
        assert!(file.read_at(8, 4).is_err());
    }

    #[test]
    fn test_bytes_read_at() {
        let data = Bytes::from_static(b"abcdef");
        assert_eq!(data.read_at(2, 2).unwrap(), b"cd");
        assert_eq!(data.read_at(6, 0).unwrap(), b"");
        assert!(matches!(data.read_at(5, 2), Err(Error::Io(_))));
    }

    #[test]
    fn test_dir_helpers() {
        let dir = tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        clear_dir(&tmp).unwrap();
        std::fs::create_dir(tmp.join("part")).unwrap();
        write_file_sync(tmp.join("part").join("a"), b"xyz").unwrap();
        write_file_sync(tmp.join("b"), b"12").unwrap();
        assert_eq!(dir_size(&tmp).unwrap(), 2);
        assert_eq!(dir_size(&tmp.join("part")).unwrap(), 3);
        clear_dir(&tmp).unwrap();
        assert_eq!(std::fs::read_dir(&tmp).unwrap().count(), 0);

        std::fs::create_dir(tmp.join("gone")).unwrap();
        remove_dir_sync(&tmp.join("gone")).unwrap();
        remove_dir_sync(&tmp.join("gone")).unwrap();
        assert!(!tmp.join("gone").exists());
    }
}
