use std::path::{Path, PathBuf};

/// Directory inside the table holding merge outputs under construction.
pub const TMP_DIR: &str = "tmp";
/// Directory inside the table holding merge transactions.
pub const TXN_DIR: &str = "txn";

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FileType {
    /// 'metaindex.bin' holds the compressed metaindex rows
    Metaindex,
    /// 'index.bin' holds compressed index blocks of block headers
    Index,
    /// 'items.bin' holds the items streams of all blocks
    Items,
    /// 'lens.bin' holds the lens streams of all blocks
    Lens,
    /// 'metadata.json' holds the part header
    Metadata,
}

#[inline]
pub(crate) fn generate_filename_static(path: impl AsRef<Path>, filetype: FileType) -> PathBuf {
    match filetype {
        FileType::Metaindex => path.as_ref().join("metaindex.bin"),
        FileType::Index => path.as_ref().join("index.bin"),
        FileType::Items => path.as_ref().join("items.bin"),
        FileType::Lens => path.as_ref().join("lens.bin"),
        FileType::Metadata => path.as_ref().join("metadata.json"),
    }
}

#[inline]
pub(crate) fn tmp_part_path(table: impl AsRef<Path>, merge_idx: u64) -> PathBuf {
    table
        .as_ref()
        .join(TMP_DIR)
        .join(format!("{:016X}", merge_idx))
}

#[inline]
pub(crate) fn txn_path(table: impl AsRef<Path>, merge_idx: u64) -> PathBuf {
    table
        .as_ref()
        .join(TXN_DIR)
        .join(format!("{:016X}", merge_idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        let table = Path::new("/data/index");
        assert_eq!(
            generate_filename_static(table.join("5_1_0000000000000001"), FileType::Lens),
            Path::new("/data/index/5_1_0000000000000001/lens.bin")
        );
        assert_eq!(
            tmp_part_path(table, 255),
            Path::new("/data/index/tmp/00000000000000FF")
        );
        assert_eq!(
            txn_path(table, 255),
            Path::new("/data/index/txn/00000000000000FF")
        );
    }
}
