//! Low level encoding helpers shared by the block and part formats.
//!
//! Fixed-width integers are big-endian, variable-length integers are unsigned
//! LEB128 and byte strings are prefixed with their varint length.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Compression level for items, lens and index block data.
pub const DEFAULT_COMPRESS_LEVEL: i32 = -5;
/// Compression level for the metaindex of a part.
pub const METAINDEX_COMPRESS_LEVEL: i32 = 0;

pub fn put_var_u64(dst: &mut Vec<u8>, v: u64) {
    // Writes into a Vec<u8> are infallible.
    let _ = leb128::write::unsigned(dst, v);
}

pub fn get_var_u64(src: &mut &[u8]) -> Result<u64> {
    leb128::read::unsigned(src).map_err(|e| Error::Decode(format!("cannot read varint: {e}")))
}

pub fn put_var_u64s(dst: &mut Vec<u8>, values: &[u64]) {
    dst.reserve(values.len());
    values.iter().for_each(|v| put_var_u64(dst, *v));
}

/// Fills `dst` with varints read from `src`.
pub fn get_var_u64s(dst: &mut [u64], src: &mut &[u8]) -> Result<()> {
    for (i, v) in dst.iter_mut().enumerate() {
        *v = get_var_u64(src)
            .map_err(|e| Error::Decode(format!("cannot read varint #{i}: {e}")))?;
    }
    Ok(())
}

pub fn put_bytes(dst: &mut Vec<u8>, b: &[u8]) {
    put_var_u64(dst, b.len() as u64);
    dst.put_slice(b);
}

pub fn get_bytes<'a>(src: &mut &'a [u8], field: &str) -> Result<&'a [u8]> {
    let len = get_var_u64(src).map_err(|e| Error::Decode(format!("{field} length: {e}")))?;
    if (src.len() as u64) < len {
        return Err(Error::Decode(format!(
            "cannot read {field}: want {len} bytes, {} remain",
            src.len()
        )));
    }
    let s: &'a [u8] = *src;
    let (b, tail) = s.split_at(len as usize);
    *src = tail;
    Ok(b)
}

pub fn get_u8(src: &mut &[u8], field: &str) -> Result<u8> {
    ensure_remaining(src, 1, field)?;
    Ok(src.get_u8())
}

pub fn get_u32(src: &mut &[u8], field: &str) -> Result<u32> {
    ensure_remaining(src, 4, field)?;
    Ok(src.get_u32())
}

pub fn get_u64(src: &mut &[u8], field: &str) -> Result<u64> {
    ensure_remaining(src, 8, field)?;
    Ok(src.get_u64())
}

fn ensure_remaining(src: &[u8], n: usize, field: &str) -> Result<()> {
    if src.remaining() < n {
        return Err(Error::Decode(format!(
            "cannot read {field} from {} bytes; need at least {n} bytes",
            src.remaining()
        )));
    }
    Ok(())
}

pub fn compress(level: i32, src: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::bulk::compress(src, level)?)
}

pub fn decompress(src: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(src).map_err(|e| Error::Decode(format!("cannot decompress data: {e}")))
}

/// Length of the common prefix of `lhs` and `rhs`.
pub fn common_prefix_len(lhs: &[u8], rhs: &[u8]) -> usize {
    common_prefix_len_chunks::<128>(lhs, rhs)
}

fn common_prefix_len_chunks<const N: usize>(lhs: &[u8], rhs: &[u8]) -> usize {
    let off = std::iter::zip(lhs.chunks_exact(N), rhs.chunks_exact(N))
        .take_while(|(a, b)| a == b)
        .count()
        * N;
    off + std::iter::zip(&lhs[off..], &rhs[off..])
        .take_while(|(a, b)| a == b)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(common_prefix_len(b"", b"abc"), 0);
        assert_eq!(common_prefix_len(b"abc", b"abd"), 2);
        assert_eq!(common_prefix_len(b"abc", b"abc"), 3);
        assert_eq!(common_prefix_len(b"abcdef", b"abc"), 3);
        let a = vec![7u8; 300];
        let mut b = a.clone();
        b[257] = 8;
        assert_eq!(common_prefix_len(&a, &b), 257);
    }

    #[test]
    fn test_bytes_and_varints() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"hello");
        put_var_u64s(&mut buf, &[0, 127, 128, u64::MAX]);
        buf.put_u32(42);

        let mut src = buf.as_slice();
        assert_eq!(get_bytes(&mut src, "item").unwrap(), b"hello");
        let mut values = [0u64; 4];
        get_var_u64s(&mut values, &mut src).unwrap();
        assert_eq!(values, [0, 127, 128, u64::MAX]);
        assert_eq!(get_u32(&mut src, "count").unwrap(), 42);
        assert!(src.is_empty());
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"hello");
        let mut src = &buf[..3];
        assert!(matches!(get_bytes(&mut src, "item"), Err(Error::Decode(_))));
        let mut src: &[u8] = &[0, 1];
        assert!(matches!(get_u32(&mut src, "count"), Err(Error::Decode(_))));
        let mut src: &[u8] = &[0x80];
        assert!(matches!(get_var_u64(&mut src), Err(Error::Decode(_))));
    }

    #[test]
    fn test_compress_decompress() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbbb".repeat(10);
        let packed = compress(DEFAULT_COMPRESS_LEVEL, &data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
        assert!(matches!(
            decompress(b"definitely not zstd"),
            Err(Error::Decode(_))
        ));
    }
}
