use bytes::BufMut;

use crate::encoding::{compress, decompress, get_bytes, get_u32, get_u64, put_bytes};
use crate::error::{Error, Result};

/// Points to one compressed index block of a part.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaindexRow {
    /// First item of the first block header in the index block.
    pub first_item: Vec<u8>,
    pub block_headers_count: u32,
    pub index_block_offset: u64,
    pub index_block_size: u32,
}

impl MetaindexRow {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, &self.first_item);
        buf.put_u32(self.block_headers_count);
        buf.put_u64(self.index_block_offset);
        buf.put_u32(self.index_block_size);
    }

    pub fn decode(src: &mut &[u8]) -> Result<Self> {
        let mr = Self {
            first_item: get_bytes(src, "first item")?.to_vec(),
            block_headers_count: get_u32(src, "block headers count")?,
            index_block_offset: get_u64(src, "index block offset")?,
            index_block_size: get_u32(src, "index block size")?,
        };
        if mr.block_headers_count == 0 {
            return Err(Error::Decode(
                "metaindex row must reference at least one block header".to_string(),
            ));
        }
        Ok(mr)
    }

    /// Encodes and compresses the whole metaindex of a part.
    pub fn encode_metaindex(rows: &[MetaindexRow], compress_level: i32) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        rows.iter().for_each(|mr| mr.encode(&mut buf));
        compress(compress_level, &buf)
    }

    /// Decompresses and decodes the whole metaindex of a part.
    pub fn decode_metaindex(compressed: &[u8]) -> Result<Vec<MetaindexRow>> {
        let data = decompress(compressed)
            .map_err(|e| Error::Decode(format!("cannot decompress metaindex: {e}")))?;
        let mut src = data.as_slice();
        let mut rows = Vec::new();
        while !src.is_empty() {
            let mr = Self::decode(&mut src).map_err(|e| {
                Error::Decode(format!("cannot decode metaindex row #{}: {e}", rows.len()))
            })?;
            rows.push(mr);
        }
        if rows.is_empty() {
            return Err(Error::Decode("metaindex has zero rows".to_string()));
        }
        if !rows.windows(2).all(|w| w[0].first_item <= w[1].first_item) {
            return Err(Error::Validation(format!(
                "{} metaindex rows are not sorted by first item",
                rows.len()
            )));
        }
        Ok(rows)
    }
}
