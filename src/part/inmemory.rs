use super::PartHeader;
use crate::block::InMemoryBlock;
use crate::error::{Error, Result};
use crate::stream::{BlockStreamWriter, PartStreams};

/// The four streams of a part kept in memory together with its header.
#[derive(Debug, Default)]
pub struct InMemoryPart {
    pub ph: PartHeader,
    pub metaindex_data: Vec<u8>,
    pub index_data: Vec<u8>,
    pub items_data: Vec<u8>,
    pub lens_data: Vec<u8>,
}

impl InMemoryPart {
    /// Builds a single-block part out of `ib`, sorting its items first.
    pub fn from_block(ib: &mut InMemoryBlock, compress_level: i32) -> Result<Self> {
        if ib.is_empty() {
            return Err(Error::Validation(
                "cannot build a part from an empty block".to_string(),
            ));
        }
        ib.sort_items();
        let ph = PartHeader {
            items_count: ib.len() as u64,
            blocks_count: 1,
            first_item: ib.item(0).to_vec(),
            last_item: ib.item(ib.len() - 1).to_vec(),
        };
        let mut writer = BlockStreamWriter::new_in_memory(compress_level);
        writer.write_block(ib)?;
        Ok(Self::from_streams(ph, writer.finish()?))
    }

    pub fn from_streams(ph: PartHeader, streams: PartStreams<Vec<u8>>) -> Self {
        Self {
            ph,
            metaindex_data: streams.metaindex,
            index_data: streams.index,
            items_data: streams.items,
            lens_data: streams.lens,
        }
    }

    pub fn size(&self) -> u64 {
        (self.metaindex_data.len()
            + self.index_data.len()
            + self.items_data.len()
            + self.lens_data.len()) as u64
    }
}
