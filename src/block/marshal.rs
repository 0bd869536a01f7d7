use bytes::{Buf, BufMut};

use super::{InMemoryBlock, Item};
use crate::encoding::{common_prefix_len, compress, decompress, get_var_u64s, put_var_u64s};
use crate::error::{Error, Result};
use crate::part::BlockHeader;

/// Blocks whose payload after common-prefix stripping is below this many bytes
/// are stored plain.
const MIN_COMPRESSIBLE_PAYLOAD: usize = 64;

/// Compressed output larger than this fraction of the payload is not worth it.
const MAX_COMPRESSION_RATIO: f64 = 0.9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum MarshalType {
    #[default]
    Plain = 0,
    Zstd = 1,
}

impl TryFrom<u8> for MarshalType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Plain),
            1 => Ok(Self::Zstd),
            _ => Err(Error::Decode(format!("unknown marshal type {v}"))),
        }
    }
}

/// Encoded items and lens streams of a single block.
#[derive(Clone, Debug, Default)]
pub struct StorageBlock {
    pub items_data: Vec<u8>,
    pub lens_data: Vec<u8>,
}

impl StorageBlock {
    pub fn reset(&mut self) {
        self.items_data.clear();
        self.lens_data.clear();
    }
}

fn corrupt(msg: impl Into<String>) -> Error {
    Error::CorruptBlock(msg.into())
}

impl InMemoryBlock {
    /// Sorts the items, then encodes them into `sb`.
    pub fn marshal_unsorted_data(
        &mut self,
        sb: &mut StorageBlock,
        compress_level: i32,
    ) -> Result<BlockHeader> {
        self.sort_items();
        self.marshal_data(sb, compress_level)
    }

    /// Encodes items that are already sorted into `sb`.
    pub fn marshal_sorted_data(
        &mut self,
        sb: &mut StorageBlock,
        compress_level: i32,
    ) -> Result<BlockHeader> {
        debug_assert!(self.is_sorted(), "items must be sorted before marshaling");
        self.update_common_prefix_sorted();
        self.marshal_data(sb, compress_level)
    }

    fn marshal_data(&self, sb: &mut StorageBlock, compress_level: i32) -> Result<BlockHeader> {
        let Some(first) = self.items.first() else {
            return Err(Error::Validation("cannot marshal an empty block".to_string()));
        };
        let data = &self.data;
        let first_item = first.bytes(data);
        let cp_len = self.common_prefix.len();
        let mut bh = BlockHeader {
            common_prefix: self.common_prefix.clone(),
            first_item: first_item.to_vec(),
            marshal_type: MarshalType::Plain,
            items_count: self.items.len() as u32,
            ..Default::default()
        };

        let items_bytes: usize = self.items.iter().map(Item::len).sum();
        let payload = items_bytes - cp_len * self.items.len();
        if self.items.len() < 2 || payload < MIN_COMPRESSIBLE_PAYLOAD {
            self.marshal_data_plain(sb);
            return Ok(bh);
        }

        let mut items_buf = Vec::with_capacity(payload);
        let mut xs = Vec::with_capacity(self.items.len() - 1);
        let mut prev_item = &first_item[cp_len..];
        let mut prev_prefix_len = 0u64;
        for it in &self.items[1..] {
            let item = &it.bytes(data)[cp_len..];
            let prefix_len = common_prefix_len(prev_item, item);
            items_buf.extend_from_slice(&item[prefix_len..]);
            xs.push(prefix_len as u64 ^ prev_prefix_len);
            prev_item = item;
            prev_prefix_len = prefix_len as u64;
        }
        let mut lens_buf = Vec::with_capacity(2 * xs.len());
        put_var_u64s(&mut lens_buf, &xs);

        xs.clear();
        let mut prev_item_len = (first_item.len() - cp_len) as u64;
        for it in &self.items[1..] {
            let item_len = (it.len() - cp_len) as u64;
            xs.push(item_len ^ prev_item_len);
            prev_item_len = item_len;
        }
        put_var_u64s(&mut lens_buf, &xs);

        sb.items_data = compress(compress_level, &items_buf)?;
        if sb.items_data.len() as f64 > MAX_COMPRESSION_RATIO * payload as f64 {
            self.marshal_data_plain(sb);
            return Ok(bh);
        }
        sb.lens_data = compress(compress_level, &lens_buf)?;
        bh.marshal_type = MarshalType::Zstd;
        Ok(bh)
    }

    fn marshal_data_plain(&self, sb: &mut StorageBlock) {
        sb.reset();
        let cp_len = self.common_prefix.len();
        for it in &self.items[1..] {
            sb.items_data.extend_from_slice(&it.bytes(&self.data)[cp_len..]);
        }
        for it in &self.items[1..] {
            sb.lens_data.put_u64((it.len() - cp_len) as u64);
        }
    }

    /// Decodes `sb` described by `bh` into the block, replacing its contents.
    pub fn unmarshal_data(&mut self, sb: &StorageBlock, bh: &BlockHeader) -> Result<()> {
        self.reset();
        if bh.items_count == 0 {
            return Err(corrupt("block header has zero items"));
        }
        if !bh.first_item.starts_with(&bh.common_prefix) {
            return Err(corrupt(format!(
                "first item {:?} does not start with the common prefix {:?}",
                bh.first_item, bh.common_prefix
            )));
        }
        self.common_prefix.extend_from_slice(&bh.common_prefix);
        match bh.marshal_type {
            MarshalType::Plain => self.unmarshal_data_plain(sb, bh)?,
            MarshalType::Zstd => self.unmarshal_data_zstd(sb, bh)?,
        }
        if !self.is_sorted() {
            return Err(corrupt("decoded items are not sorted"));
        }
        Ok(())
    }

    fn unmarshal_data_zstd(&mut self, sb: &StorageBlock, bh: &BlockHeader) -> Result<()> {
        let n = bh.items_count as usize;
        let cp_len = bh.common_prefix.len();

        let lens_buf = decompress(&sb.lens_data)?;
        // Every varint takes at least one byte.
        if lens_buf.len() < 2 * (n - 1) {
            return Err(corrupt(format!(
                "lens data of {} bytes cannot hold lens of {n} items",
                lens_buf.len()
            )));
        }
        let mut src = lens_buf.as_slice();
        let mut xs = vec![0u64; n - 1];
        get_var_u64s(&mut xs, &mut src)
            .map_err(|e| corrupt(format!("cannot read prefix lens: {e}")))?;
        let mut prefix_lens = vec![0u64; n];
        for i in 1..n {
            prefix_lens[i] = xs[i - 1] ^ prefix_lens[i - 1];
        }
        get_var_u64s(&mut xs, &mut src).map_err(|e| corrupt(format!("cannot read lens: {e}")))?;
        if !src.is_empty() {
            return Err(corrupt(format!(
                "unexpected tail of {} bytes left after reading lens",
                src.len()
            )));
        }
        let mut lens = vec![0u64; n];
        lens[0] = (bh.first_item.len() - cp_len) as u64;
        let mut data_len = bh.first_item.len() as u64;
        for i in 1..n {
            lens[i] = xs[i - 1] ^ lens[i - 1];
            data_len = lens[i]
                .checked_add(cp_len as u64)
                .and_then(|len| data_len.checked_add(len))
                .filter(|len| *len <= u32::MAX as u64)
                .ok_or_else(|| corrupt("decoded item lens overflow the block"))?;
        }

        let items_buf = decompress(&sb.items_data)?;
        let mut b = items_buf.as_slice();
        self.data.reserve(data_len as usize);
        self.data.extend_from_slice(&bh.first_item);
        self.items.push(Item::new(0, self.data.len()));
        let mut prev_start = cp_len;
        for i in 1..n {
            let (item_len, prefix_len) = (lens[i], prefix_lens[i]);
            if prefix_len > item_len {
                return Err(corrupt(format!(
                    "prefix len {prefix_len} exceeds item len {item_len}"
                )));
            }
            let prev_len = (self.data.len() - prev_start) as u64;
            if prefix_len > prev_len {
                return Err(corrupt(format!(
                    "prefix len {prefix_len} exceeds the previous item len {prev_len}"
                )));
            }
            let suffix_len = (item_len - prefix_len) as usize;
            if b.len() < suffix_len {
                return Err(corrupt(format!(
                    "cannot read item suffix of {suffix_len} bytes; {} bytes remain",
                    b.len()
                )));
            }
            let start = self.data.len();
            self.data.extend_from_slice(&bh.common_prefix);
            self.data
                .extend_from_within(prev_start..prev_start + prefix_len as usize);
            self.data.extend_from_slice(&b[..suffix_len]);
            b = &b[suffix_len..];
            self.items.push(Item::new(start, self.data.len()));
            prev_start = start + cp_len;
        }
        if !b.is_empty() {
            return Err(corrupt(format!(
                "unexpected tail of {} bytes left after reading items",
                b.len()
            )));
        }
        if self.data.len() as u64 != data_len {
            return Err(corrupt(format!(
                "decoded {} bytes of items; want {data_len}",
                self.data.len()
            )));
        }
        Ok(())
    }

    fn unmarshal_data_plain(&mut self, sb: &StorageBlock, bh: &BlockHeader) -> Result<()> {
        let n = bh.items_count as usize;
        if sb.lens_data.len() != 8 * (n - 1) {
            return Err(corrupt(format!(
                "plain lens data of {} bytes cannot hold {} lens",
                sb.lens_data.len(),
                n - 1
            )));
        }
        let mut lens = sb.lens_data.as_slice();
        let mut b = sb.items_data.as_slice();
        self.data.extend_from_slice(&bh.first_item);
        self.items.push(Item::new(0, self.data.len()));
        for _ in 1..n {
            let len = lens.get_u64();
            if (b.len() as u64) < len {
                return Err(corrupt(format!(
                    "cannot read item of {len} bytes; {} bytes remain",
                    b.len()
                )));
            }
            let start = self.data.len();
            self.data.extend_from_slice(&bh.common_prefix);
            self.data.extend_from_slice(&b[..len as usize]);
            b = &b[len as usize..];
            self.items.push(Item::new(start, self.data.len()));
        }
        if !b.is_empty() {
            return Err(corrupt(format!(
                "unexpected tail of {} bytes left after reading items",
                b.len()
            )));
        }
        Ok(())
    }
}
