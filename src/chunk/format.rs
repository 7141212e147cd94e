//! Wire form of a chunk: a single contiguous buffer holding the format
//! version, both encoder tables and the data block.
//!
//! All multi-byte integers are little-endian:
//!
//! ```text
//! +---------------------------+
//! | version_len : u32         |
//! | version     : utf-8[v]    |
//! | shapes      : table       |
//! | byte_pos    : table       |
//! | data        : bytes       |
//! +---------------------------+
//! table := dtype code (u8) | ndim (u8) | dims (u32 each) | values (u32 each)
//! ```

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::dtype::{DataType, IntSize};
use crate::encode::U32Table;
use crate::error::ChunkError;

const TABLE_DTYPE: DataType = DataType::UInt(IntSize::b32);
const TABLE_NDIM: u8 = 2;

/// A parsed chunk buffer. Tables are decoded eagerly (they are small); the
/// data block is a view into the source buffer unless a copy was requested.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub version: String,
    pub shapes: U32Table,
    pub byte_positions: U32Table,
    pub data: Bytes,
}

fn table_nbytes(table: &U32Table) -> usize {
    // dtype code + ndim + two dims + values
    1 + 1 + 8 + 4 * table.values.len()
}

/// Exact serialized length, without materializing the buffer. The external
/// cache uses this to size entries.
pub fn infer_chunk_num_bytes(
    version: &str,
    shapes: &U32Table,
    byte_positions: &U32Table,
    len_data: usize,
) -> usize {
    4 + version.len() + table_nbytes(shapes) + table_nbytes(byte_positions) + len_data
}

fn write_table(out: &mut Vec<u8>, table: &U32Table) {
    out.push(TABLE_DTYPE.code());
    out.push(TABLE_NDIM);
    out.write_u32::<LittleEndian>(table.num_rows() as u32)
        .expect("vec write cannot fail");
    out.write_u32::<LittleEndian>(table.cols as u32)
        .expect("vec write cannot fail");
    for v in &table.values {
        out.write_u32::<LittleEndian>(*v)
            .expect("vec write cannot fail");
    }
}

/// Serializes a chunk into one contiguous buffer. `data_parts` are
/// concatenated to form the data block.
pub fn serialize_chunk(
    version: &str,
    shapes: &U32Table,
    byte_positions: &U32Table,
    data_parts: &[&[u8]],
) -> Vec<u8> {
    let len_data: usize = data_parts.iter().map(|p| p.len()).sum();
    let total = infer_chunk_num_bytes(version, shapes, byte_positions, len_data);
    let mut out = Vec::with_capacity(total);
    out.write_u32::<LittleEndian>(version.len() as u32)
        .expect("vec write cannot fail");
    out.extend_from_slice(version.as_bytes());
    write_table(&mut out, shapes);
    write_table(&mut out, byte_positions);
    for part in data_parts {
        out.extend_from_slice(part);
    }
    debug_assert_eq!(out.len(), total);
    out
}

fn read_table(cursor: &mut Cursor<&[u8]>, version: &str) -> Result<U32Table, ChunkError> {
    let at = |c: &Cursor<&[u8]>| c.position() as usize;
    let fmt = |offset, reason: &str| ChunkError::format(version, offset, reason);

    let offset = at(cursor);
    let code = cursor
        .read_u8()
        .map_err(|_| fmt(offset, "truncated table header"))?;
    if DataType::from_code(code) != Some(TABLE_DTYPE) {
        return Err(fmt(offset, "unsupported table dtype"));
    }
    let ndim = cursor
        .read_u8()
        .map_err(|_| fmt(at(cursor), "truncated table header"))?;
    if ndim != TABLE_NDIM {
        return Err(fmt(at(cursor), "encoder table must be 2-D"));
    }
    let rows = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| fmt(at(cursor), "truncated table dims"))? as usize;
    let cols = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| fmt(at(cursor), "truncated table dims"))? as usize;
    let count = rows
        .checked_mul(cols)
        .ok_or_else(|| fmt(at(cursor), "table dims overflow"))?;
    let remaining = cursor.get_ref().len() - at(cursor);
    if count.checked_mul(4).map_or(true, |n| n > remaining) {
        return Err(fmt(at(cursor), "table extends past end of buffer"));
    }
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(
            cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| fmt(at(cursor), "truncated table values"))?,
        );
    }
    Ok(U32Table { cols, values })
}

/// Parses a serialized chunk.
///
/// With `copy == false` the returned data block is a zero-copy view into
/// `buf`; with `copy == true` it is an independent allocation.
pub fn deserialize_chunk(buf: &Bytes, copy: bool) -> Result<RawChunk, ChunkError> {
    let slice: &[u8] = buf;
    let mut cursor = Cursor::new(slice);

    let vlen = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| ChunkError::format("", 0, "truncated version length"))?
        as usize;
    let vstart = cursor.position() as usize;
    if vstart + vlen > slice.len() {
        return Err(ChunkError::format("", vstart, "version extends past end of buffer"));
    }
    let version = std::str::from_utf8(&slice[vstart..vstart + vlen])
        .map_err(|_| ChunkError::format("", vstart, "version is not utf-8"))?
        .to_owned();
    cursor.set_position((vstart + vlen) as u64);

    let shapes = read_table(&mut cursor, &version)?;
    let byte_positions = read_table(&mut cursor, &version)?;

    let data_start = cursor.position() as usize;
    let data = if copy {
        Bytes::copy_from_slice(&slice[data_start..])
    } else {
        buf.slice(data_start..)
    };
    Ok(RawChunk {
        version,
        shapes,
        byte_positions,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tables() -> (U32Table, U32Table) {
        let mut shapes = U32Table::new(3);
        shapes.push_row(&[8, 8, 3]);
        shapes.push_row(&[4, 4, 4]);
        let mut bpos = U32Table::new(3);
        bpos.push_row(&[64, 0, 3]);
        bpos.push_row(&[16, 256, 4]);
        (shapes, bpos)
    }

    #[test]
    fn roundtrip_preserves_everything() {
        let (shapes, bpos) = sample_tables();
        let data = vec![7u8; 272];
        let buf = serialize_chunk("1.1", &shapes, &bpos, &[&data]);
        let raw = deserialize_chunk(&Bytes::from(buf), true).unwrap();
        assert_eq!(raw.version, "1.1");
        assert_eq!(raw.shapes, shapes);
        assert_eq!(raw.byte_positions, bpos);
        assert_eq!(&raw.data[..], &data[..]);
    }

    #[test]
    fn inferred_length_is_exact() {
        let (shapes, bpos) = sample_tables();
        for len_data in [0usize, 1, 64, 4096] {
            let data = vec![0u8; len_data];
            let buf = serialize_chunk("1.1", &shapes, &bpos, &[&data]);
            assert_eq!(buf.len(), infer_chunk_num_bytes("1.1", &shapes, &bpos, len_data));
        }
    }

    #[test]
    fn multiple_data_parts_concatenate() {
        let (shapes, bpos) = sample_tables();
        let buf = serialize_chunk("1.1", &shapes, &bpos, &[b"abc", b"", b"def"]);
        let raw = deserialize_chunk(&Bytes::from(buf), true).unwrap();
        assert_eq!(&raw.data[..], b"abcdef");
    }

    #[test]
    fn zero_copy_view_shares_the_buffer() {
        let (shapes, bpos) = sample_tables();
        let data = vec![5u8; 32];
        let buf = Bytes::from(serialize_chunk("1.1", &shapes, &bpos, &[&data]));
        let raw = deserialize_chunk(&buf, false).unwrap();
        assert_eq!(&raw.data[..], &data[..]);
        // same allocation: the view starts inside the source buffer
        let src_range = buf.as_ptr() as usize..buf.as_ptr() as usize + buf.len();
        assert!(src_range.contains(&(raw.data.as_ptr() as usize)));
    }

    #[test]
    fn malformed_buffers_are_rejected() {
        assert!(matches!(
            deserialize_chunk(&Bytes::from_static(b"\x02"), true),
            Err(ChunkError::ChunkFormat { .. })
        ));

        let (shapes, bpos) = sample_tables();
        let mut buf = serialize_chunk("1.1", &shapes, &bpos, &[b"xyz"]);
        buf.truncate(10);
        assert!(matches!(
            deserialize_chunk(&Bytes::from(buf), true),
            Err(ChunkError::ChunkFormat { .. })
        ));
    }
}
