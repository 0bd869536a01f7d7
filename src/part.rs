mod block_header;
mod inmemory;
mod metaindex_row;
mod part_header;
mod search;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use block_header::BlockHeader;
use bytes::Bytes;
pub use inmemory::InMemoryPart;
pub use metaindex_row::MetaindexRow;
pub use part_header::PartHeader;
pub use search::PartSearch;

use crate::block::{InMemoryBlock, StorageBlock};
use crate::encoding::decompress;
use crate::error::{Error, Result};
use crate::fs::filename::{generate_filename_static, FileType};
use crate::fs::{FileObject, ReadAt};

/// Decoded index blocks keyed by their offset in the index stream.
pub type IndexBlockCache = moka::sync::Cache<u64, Arc<IndexBlock>>;

/// The block headers of one index block.
#[derive(Debug, Default)]
pub struct IndexBlock {
    pub bhs: Vec<BlockHeader>,
}

/// An immutable sorted run of items, stored in a directory or in memory.
pub struct Part {
    ph: PartHeader,
    /// `None` for in-memory parts.
    path: Option<PathBuf>,
    size: u64,
    mrs: Vec<MetaindexRow>,
    index_file: Box<dyn ReadAt>,
    items_file: Box<dyn ReadAt>,
    lens_file: Box<dyn ReadAt>,
    index_cache: IndexBlockCache,
}

impl std::fmt::Debug for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Part")
            .field("path", &self.path)
            .field("items_count", &self.ph.items_count)
            .field("blocks_count", &self.ph.blocks_count)
            .field("size", &self.size)
            .finish()
    }
}

impl Part {
    /// Opens the part stored in `path`.
    pub fn open(path: &Path, index_cache_capacity: u64) -> Result<Self> {
        let ph = PartHeader::from_dir(path)?;
        let metaindex = std::fs::read(generate_filename_static(path, FileType::Metaindex))?;
        let index_file = FileObject::open(&generate_filename_static(path, FileType::Index))?;
        let items_file = FileObject::open(&generate_filename_static(path, FileType::Items))?;
        let lens_file = FileObject::open(&generate_filename_static(path, FileType::Lens))?;
        let size =
            metaindex.len() as u64 + index_file.size() + items_file.size() + lens_file.size();
        let part = Self::new(
            ph,
            Some(path.to_path_buf()),
            size,
            &metaindex,
            Box::new(index_file),
            Box::new(items_file),
            Box::new(lens_file),
            index_cache_capacity,
        )?;
        log::debug!(
            "opened part {} with {} items in {} blocks",
            path.display(),
            part.ph.items_count,
            part.ph.blocks_count
        );
        Ok(part)
    }

    /// Wraps the buffers of an in-memory part.
    pub fn from_inmemory(mp: InMemoryPart, index_cache_capacity: u64) -> Result<Self> {
        let size = mp.size();
        let InMemoryPart {
            ph,
            metaindex_data,
            index_data,
            items_data,
            lens_data,
        } = mp;
        Self::new(
            ph,
            None,
            size,
            &metaindex_data,
            Box::new(Bytes::from(index_data)),
            Box::new(Bytes::from(items_data)),
            Box::new(Bytes::from(lens_data)),
            index_cache_capacity,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        ph: PartHeader,
        path: Option<PathBuf>,
        size: u64,
        metaindex: &[u8],
        index_file: Box<dyn ReadAt>,
        items_file: Box<dyn ReadAt>,
        lens_file: Box<dyn ReadAt>,
        index_cache_capacity: u64,
    ) -> Result<Self> {
        ph.validate()?;
        let mrs = MetaindexRow::decode_metaindex(metaindex)?;
        if mrs[0].first_item != ph.first_item {
            return Err(Error::Validation(format!(
                "first metaindex item {:?} differs from the first part item {:?}",
                mrs[0].first_item, ph.first_item
            )));
        }
        let block_headers: u64 = mrs.iter().map(|mr| mr.block_headers_count as u64).sum();
        if block_headers != ph.blocks_count {
            return Err(Error::Validation(format!(
                "metaindex references {block_headers} blocks; part header has {}",
                ph.blocks_count
            )));
        }
        Ok(Self {
            ph,
            path,
            size,
            mrs,
            index_file,
            items_file,
            lens_file,
            index_cache: IndexBlockCache::new(index_cache_capacity),
        })
    }

    pub fn header(&self) -> &PartHeader {
        &self.ph
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }

    /// Size of the part streams in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn metaindex(&self) -> &[MetaindexRow] {
        &self.mrs
    }

    /// Reads and decodes the index block referenced by `mr`.
    pub fn read_index_block(&self, mr: &MetaindexRow) -> Result<Arc<IndexBlock>> {
        let packed = self
            .index_file
            .read_at(mr.index_block_offset, mr.index_block_size as usize)?;
        let data = decompress(&packed).map_err(|e| {
            Error::Decode(format!(
                "cannot decompress index block at offset {}: {e}",
                mr.index_block_offset
            ))
        })?;
        let bhs = BlockHeader::decode_block_headers(&data, mr.block_headers_count as usize)?;
        if bhs[0].first_item != mr.first_item {
            return Err(Error::Validation(format!(
                "first block header item {:?} differs from the metaindex row item {:?}",
                bhs[0].first_item, mr.first_item
            )));
        }
        Ok(Arc::new(IndexBlock { bhs }))
    }

    /// Same as [`Part::read_index_block`], going through the index block cache.
    pub fn read_index_block_cached(&self, mr: &MetaindexRow) -> Result<Arc<IndexBlock>> {
        self.index_cache
            .try_get_with(mr.index_block_offset, || self.read_index_block(mr))
            .map_err(Error::from_shared)
    }

    /// Reads the block described by `bh` into `ib`, using `sb` as scratch space.
    pub fn read_block(
        &self,
        bh: &BlockHeader,
        sb: &mut StorageBlock,
        ib: &mut InMemoryBlock,
    ) -> Result<()> {
        sb.items_data = self
            .items_file
            .read_at(bh.items_block_offset, bh.items_block_size as usize)?;
        sb.lens_data = self
            .lens_file
            .read_at(bh.lens_block_offset, bh.lens_block_size as usize)?;
        ib.unmarshal_data(sb, bh)
    }
}
