//! In-place upgrade of chunks written by older format versions.
//!
//! Version history:
//! - `"1.0"`: byte positions were stored as `(nbytes, last_index)` pairs
//!   with starts implied by contiguity.
//! - `"1.1"` (current): byte positions carry an explicit start column, so
//!   runs survive in-place updates without a rebuild.

use std::cmp::Ordering;

use crate::encode::{BytePositionsEncoder, ShapeEncoder, U32Table};
use crate::error::ChunkError;

use super::ChunkCore;

fn parse_version(v: &str) -> Vec<u64> {
    v.split('.').map(|p| p.parse().unwrap_or(0)).collect()
}

pub(crate) fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (parse_version(a), parse_version(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

pub(crate) fn decode_shape_table(
    version: &str,
    table: &U32Table,
) -> Result<ShapeEncoder, ChunkError> {
    ShapeEncoder::from_table(table).map_err(|reason| ChunkError::format(version, 0, reason))
}

/// Version-aware byte position decoding; legacy two-column tables get their
/// start column reconstructed.
pub(crate) fn decode_byte_positions_table(
    version: &str,
    table: &U32Table,
) -> Result<BytePositionsEncoder, ChunkError> {
    let fmt = |reason| ChunkError::format(version, 0, reason);
    if !table.is_empty()
        && table.cols == 2
        && compare_versions(version, crate::CHUNK_FORMAT_VERSION) == Ordering::Less
    {
        let pairs = (0..table.num_rows()).map(|r| {
            let row = table.row(r);
            (row[0] as u64, row[1] as u64)
        });
        return BytePositionsEncoder::from_sizes(pairs).map_err(fmt);
    }
    BytePositionsEncoder::from_table(table).map_err(fmt)
}

/// Brings the chunk to the current format version. Idempotent.
///
/// Decoding already normalizes the in-memory encoders, so upgrading re-tags
/// the chunk; the next serialization emits the current table layout.
pub(crate) fn fast_forward_chunk(core: &mut ChunkCore) {
    if compare_versions(&core.version, crate::CHUNK_FORMAT_VERSION) == Ordering::Less {
        core.version = crate::CHUNK_FORMAT_VERSION.to_owned();
    }
}
