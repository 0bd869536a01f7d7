use bytes::BufMut;

use crate::block::MarshalType;
use crate::encoding::{get_bytes, get_u32, get_u64, get_u8, put_bytes};
use crate::error::{Error, Result};

/// Locates one block inside the items and lens streams of a part.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub common_prefix: Vec<u8>,
    pub first_item: Vec<u8>,
    pub marshal_type: MarshalType,
    pub items_count: u32,
    pub items_block_offset: u64,
    pub lens_block_offset: u64,
    pub items_block_size: u32,
    pub lens_block_size: u32,
}

impl BlockHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, &self.common_prefix);
        put_bytes(buf, &self.first_item);
        buf.put_u8(self.marshal_type as u8);
        buf.put_u32(self.items_count);
        buf.put_u64(self.items_block_offset);
        buf.put_u64(self.lens_block_offset);
        buf.put_u32(self.items_block_size);
        buf.put_u32(self.lens_block_size);
    }

    pub fn decode(src: &mut &[u8]) -> Result<Self> {
        let common_prefix = get_bytes(src, "common prefix")?.to_vec();
        let first_item = get_bytes(src, "first item")?.to_vec();
        let marshal_type = MarshalType::try_from(get_u8(src, "marshal type")?)?;
        let bh = Self {
            common_prefix,
            first_item,
            marshal_type,
            items_count: get_u32(src, "items count")?,
            items_block_offset: get_u64(src, "items block offset")?,
            lens_block_offset: get_u64(src, "lens block offset")?,
            items_block_size: get_u32(src, "items block size")?,
            lens_block_size: get_u32(src, "lens block size")?,
        };
        if bh.items_count == 0 {
            return Err(Error::Decode(
                "items count in block header must be greater than 0".to_string(),
            ));
        }
        Ok(bh)
    }

    /// Decodes exactly `count` headers from an uncompressed index block.
    pub fn decode_block_headers(mut src: &[u8], count: usize) -> Result<Vec<Self>> {
        if count == 0 {
            return Err(Error::Decode("index block must hold block headers".to_string()));
        }
        let mut bhs = Vec::with_capacity(count);
        for i in 0..count {
            let bh = Self::decode(&mut src).map_err(|e| {
                Error::Decode(format!("cannot decode block header #{i} of {count}: {e}"))
            })?;
            bhs.push(bh);
        }
        if !src.is_empty() {
            return Err(Error::Decode(format!(
                "unexpected tail of {} bytes after {count} block headers",
                src.len()
            )));
        }
        if !bhs.windows(2).all(|w| w[0].first_item <= w[1].first_item) {
            return Err(Error::Validation(format!(
                "{count} block headers are not sorted by first item"
            )));
        }
        Ok(bhs)
    }
}
