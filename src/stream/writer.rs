use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::block::{InMemoryBlock, StorageBlock};
use crate::encoding::{compress, METAINDEX_COMPRESS_LEVEL};
use crate::error::Result;
use crate::fs::filename::{generate_filename_static, FileType};
use crate::part::MetaindexRow;

/// Uncompressed index blocks are flushed once they reach this size.
const MAX_INDEX_BLOCK_SIZE: usize = 64 * 1024;

/// A sequential output stream of a part.
pub trait StreamSink: Write {
    /// Makes everything written so far durable.
    fn sync(&mut self) -> std::io::Result<()>;
}

impl StreamSink for Vec<u8> {
    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StreamSink for BufWriter<File> {
    fn sync(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.get_ref().sync_all()
    }
}

/// The four output streams of a part.
#[derive(Debug, Default)]
pub struct PartStreams<W> {
    pub metaindex: W,
    pub index: W,
    pub items: W,
    pub lens: W,
}

/// Serializes sorted blocks into the streams of a part, building the index
/// blocks and the metaindex on the fly.
pub struct BlockStreamWriter<W: StreamSink> {
    streams: PartStreams<W>,
    path: Option<PathBuf>,
    compress_level: i32,

    sb: StorageBlock,
    mr: MetaindexRow,
    mr_first_item_caught: bool,

    unpacked_index_block: Vec<u8>,
    unpacked_metaindex: Vec<u8>,

    items_block_offset: u64,
    lens_block_offset: u64,
    index_block_offset: u64,
}

impl BlockStreamWriter<Vec<u8>> {
    pub fn new_in_memory(compress_level: i32) -> Self {
        Self::new(PartStreams::default(), None, compress_level)
    }
}

impl BlockStreamWriter<BufWriter<File>> {
    /// Creates the directory `path` with empty part files in it.
    /// Fails if `path` already exists.
    pub fn create_file_part(path: &Path, compress_level: i32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir(path)?;
        let create = |filetype| -> Result<BufWriter<File>> {
            Ok(BufWriter::new(File::create(generate_filename_static(
                path, filetype,
            ))?))
        };
        let streams = (|| -> Result<PartStreams<BufWriter<File>>> {
            Ok(PartStreams {
                metaindex: create(FileType::Metaindex)?,
                index: create(FileType::Index)?,
                items: create(FileType::Items)?,
                lens: create(FileType::Lens)?,
            })
        })();
        match streams {
            Ok(streams) => Ok(Self::new(streams, Some(path.to_path_buf()), compress_level)),
            Err(e) => {
                let _ = std::fs::remove_dir_all(path);
                Err(e)
            }
        }
    }
}

impl<W: StreamSink> BlockStreamWriter<W> {
    fn new(streams: PartStreams<W>, path: Option<PathBuf>, compress_level: i32) -> Self {
        Self {
            streams,
            path,
            compress_level,
            sb: StorageBlock::default(),
            mr: MetaindexRow::default(),
            mr_first_item_caught: false,
            unpacked_index_block: Vec::new(),
            unpacked_metaindex: Vec::new(),
            items_block_offset: 0,
            lens_block_offset: 0,
            index_block_offset: 0,
        }
    }

    /// Directory of the part being written, `None` for in-memory parts.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends a sorted block. Blocks must arrive in non-decreasing order.
    pub fn write_block(&mut self, ib: &mut InMemoryBlock) -> Result<()> {
        let mut bh = ib.marshal_sorted_data(&mut self.sb, self.compress_level)?;
        if !self.mr_first_item_caught {
            self.mr.first_item.clear();
            self.mr.first_item.extend_from_slice(&bh.first_item);
            self.mr_first_item_caught = true;
        }

        self.streams.items.write_all(&self.sb.items_data)?;
        bh.items_block_size = self.sb.items_data.len() as u32;
        bh.items_block_offset = self.items_block_offset;
        self.items_block_offset += bh.items_block_size as u64;

        self.streams.lens.write_all(&self.sb.lens_data)?;
        bh.lens_block_size = self.sb.lens_data.len() as u32;
        bh.lens_block_offset = self.lens_block_offset;
        self.lens_block_offset += bh.lens_block_size as u64;

        bh.encode(&mut self.unpacked_index_block);
        self.mr.block_headers_count += 1;
        if self.unpacked_index_block.len() >= MAX_INDEX_BLOCK_SIZE {
            self.flush_index_data()?;
        }
        Ok(())
    }

    fn flush_index_data(&mut self) -> Result<()> {
        if self.unpacked_index_block.is_empty() {
            return Ok(());
        }
        let packed = compress(self.compress_level, &self.unpacked_index_block)?;
        self.streams.index.write_all(&packed)?;
        self.mr.index_block_size = packed.len() as u32;
        self.mr.index_block_offset = self.index_block_offset;
        self.index_block_offset += packed.len() as u64;
        self.unpacked_index_block.clear();

        self.mr.encode(&mut self.unpacked_metaindex);
        log::debug!(
            "flushed index block with {} block headers at offset {}",
            self.mr.block_headers_count,
            self.mr.index_block_offset
        );
        self.mr = MetaindexRow::default();
        self.mr_first_item_caught = false;
        Ok(())
    }

    /// Flushes the pending index block and the metaindex, then syncs every
    /// stream.
    pub fn finish(mut self) -> Result<PartStreams<W>> {
        self.flush_index_data()?;
        let packed = compress(METAINDEX_COMPRESS_LEVEL, &self.unpacked_metaindex)?;
        self.streams.metaindex.write_all(&packed)?;
        for stream in [
            &mut self.streams.metaindex,
            &mut self.streams.index,
            &mut self.streams.items,
            &mut self.streams.lens,
        ] {
            stream.sync()?;
        }
        Ok(self.streams)
    }
}
