use crate::compression::Compression;
use crate::dtype::{DataType, NBytes};
use crate::error::ChunkError;
use crate::SampleShape;

/// One tile cut from an oversize sample.
#[derive(Debug)]
pub struct Tile {
    pub bytes: Vec<u8>,
    pub tile_shape: SampleShape,
    /// True only for the first tile of the sample; the tensor descriptor is
    /// updated exactly once, on this tile.
    pub is_first_write: bool,
}

/// A finite, non-restartable sequence of uniform tile buffers cut from one
/// sample whose serialized form exceeds the chunk budget.
///
/// Tiles share a common shape; edge tiles are zero-padded to it. Every tile
/// fits a single chunk, so the writer consumes exactly one tile per fresh
/// chunk.
#[derive(Debug, Clone)]
pub struct SampleTiles {
    bytes: Vec<u8>,
    dtype: DataType,
    sample_shape: SampleShape,
    tile_shape: SampleShape,
    grid: SampleShape,
    next: usize,
    codec: Option<Compression>,
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

impl SampleTiles {
    /// Splits `bytes` (row-major elements of `dtype`, logical shape
    /// `sample_shape`) into tiles of at most `max_tile_nbytes` each.
    ///
    /// `codec` is applied per tile after slicing, for chunks that compress
    /// samples individually.
    pub(crate) fn new(
        bytes: Vec<u8>,
        dtype: DataType,
        sample_shape: SampleShape,
        max_tile_nbytes: usize,
        codec: Option<Compression>,
    ) -> Self {
        let item = dtype.nbytes() as u64;
        let mut tile_shape = sample_shape.clone();
        let mut splits: Vec<u64> = vec![1; sample_shape.len()];
        loop {
            let tile_nbytes: u64 = tile_shape.iter().product::<u64>() * item;
            if tile_nbytes <= max_tile_nbytes as u64 {
                break;
            }
            let axis = tile_shape
                .iter()
                .enumerate()
                .max_by_key(|(_, d)| **d)
                .map(|(a, _)| a)
                .expect("tiled sample must have at least one axis");
            if tile_shape[axis] <= 1 {
                break;
            }
            splits[axis] += 1;
            tile_shape[axis] = div_ceil(sample_shape[axis], splits[axis]);
        }
        let grid: SampleShape = sample_shape
            .iter()
            .zip(tile_shape.iter())
            .map(|(s, t)| div_ceil(*s, *t))
            .collect();
        Self {
            bytes,
            dtype,
            sample_shape,
            tile_shape,
            grid,
            next: 0,
            codec,
        }
    }

    pub fn sample_shape(&self) -> &SampleShape {
        &self.sample_shape
    }

    pub fn tile_shape(&self) -> &SampleShape {
        &self.tile_shape
    }

    pub fn num_tiles(&self) -> usize {
        self.grid.iter().product::<u64>() as usize
    }

    pub fn tiles_yielded(&self) -> usize {
        self.next
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.num_tiles()
    }

    /// Cuts and returns the next tile, or `None` once all tiles are out.
    pub fn yield_tile(&mut self) -> Result<Option<Tile>, ChunkError> {
        if self.is_exhausted() {
            return Ok(None);
        }
        let t = self.next;
        self.next += 1;
        let mut bytes = self.extract(t);
        if let Some(codec) = self.codec {
            bytes = codec.compress(&bytes)?;
        }
        Ok(Some(Tile {
            bytes,
            tile_shape: self.tile_shape.clone(),
            is_first_write: t == 0,
        }))
    }

    /// Copies tile `t` (row-major over the tile grid) into a zero-padded
    /// buffer of the uniform tile shape.
    fn extract(&self, t: usize) -> Vec<u8> {
        let ndim = self.sample_shape.len();
        let item = self.dtype.nbytes();

        // tile coordinate in the grid, row-major
        let mut coord = vec![0u64; ndim];
        let mut rem = t as u64;
        for a in (0..ndim).rev() {
            coord[a] = rem % self.grid[a];
            rem /= self.grid[a];
        }

        let origin: Vec<u64> = (0..ndim).map(|a| coord[a] * self.tile_shape[a]).collect();
        let copy_len: Vec<u64> = (0..ndim)
            .map(|a| self.tile_shape[a].min(self.sample_shape[a] - origin[a]))
            .collect();

        // element strides, row-major
        let mut src_stride = vec![1u64; ndim];
        let mut dst_stride = vec![1u64; ndim];
        for a in (0..ndim.saturating_sub(1)).rev() {
            src_stride[a] = src_stride[a + 1] * self.sample_shape[a + 1];
            dst_stride[a] = dst_stride[a + 1] * self.tile_shape[a + 1];
        }

        let tile_elems: u64 = self.tile_shape.iter().product();
        let mut out = vec![0u8; tile_elems as usize * item];

        let run = copy_len[ndim - 1] as usize * item;
        let mut idx = vec![0u64; ndim.saturating_sub(1)];
        loop {
            let mut src_off = 0u64;
            let mut dst_off = 0u64;
            for a in 0..ndim - 1 {
                src_off += (origin[a] + idx[a]) * src_stride[a];
                dst_off += idx[a] * dst_stride[a];
            }
            src_off += origin[ndim - 1] * src_stride[ndim - 1];
            let src_byte = src_off as usize * item;
            let dst_byte = dst_off as usize * item;
            out[dst_byte..dst_byte + run]
                .copy_from_slice(&self.bytes[src_byte..src_byte + run]);

            // odometer over all axes but the innermost
            let mut a = idx.len();
            loop {
                if a == 0 {
                    return out;
                }
                a -= 1;
                idx[a] += 1;
                if idx[a] < copy_len[a] {
                    break;
                }
                idx[a] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::IntSize;
    use smallvec::smallvec;

    #[test]
    fn exact_multiple_yields_exact_tile_count() {
        // 3 x max bytes in one axis splits into exactly three tiles
        let max = 1024usize;
        let bytes: Vec<u8> = (0..3 * max).map(|i| i as u8).collect();
        let mut tiles = SampleTiles::new(
            bytes.clone(),
            DataType::UInt(IntSize::b8),
            smallvec![3 * max as u64],
            max,
            None,
        );
        assert_eq!(tiles.num_tiles(), 3);
        assert_eq!(tiles.tile_shape().as_slice(), &[max as u64]);

        let first = tiles.yield_tile().unwrap().unwrap();
        assert!(first.is_first_write);
        assert_eq!(first.bytes, &bytes[..max]);

        let second = tiles.yield_tile().unwrap().unwrap();
        assert!(!second.is_first_write);
        assert_eq!(second.bytes, &bytes[max..2 * max]);

        let third = tiles.yield_tile().unwrap().unwrap();
        assert_eq!(third.bytes, &bytes[2 * max..]);
        assert!(tiles.is_exhausted());
        assert!(tiles.yield_tile().unwrap().is_none());
    }

    #[test]
    fn edge_tiles_are_zero_padded() {
        // 5x5 bytes with a 9-byte budget tiles as a 2x2 grid of 3x3
        let bytes: Vec<u8> = (1..=25).collect();
        let mut tiles = SampleTiles::new(
            bytes,
            DataType::UInt(IntSize::b8),
            smallvec![5, 5],
            9,
            None,
        );
        assert_eq!(tiles.tile_shape().as_slice(), &[3, 3]);
        assert_eq!(tiles.num_tiles(), 4);

        let t0 = tiles.yield_tile().unwrap().unwrap();
        assert_eq!(t0.bytes, vec![1, 2, 3, 6, 7, 8, 11, 12, 13]);

        // right edge: two columns of data, one of padding
        let t1 = tiles.yield_tile().unwrap().unwrap();
        assert_eq!(t1.bytes, vec![4, 5, 0, 9, 10, 0, 14, 15, 0]);

        let t2 = tiles.yield_tile().unwrap().unwrap();
        assert_eq!(t2.bytes, vec![16, 17, 18, 21, 22, 23, 0, 0, 0]);

        let t3 = tiles.yield_tile().unwrap().unwrap();
        assert_eq!(t3.bytes, vec![19, 20, 0, 24, 25, 0, 0, 0, 0]);
    }

    #[test]
    fn multibyte_elements_respect_item_size() {
        let mut bytes = Vec::new();
        for v in 0u32..8 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut tiles = SampleTiles::new(
            bytes,
            DataType::UInt(IntSize::b32),
            smallvec![8],
            16,
            None,
        );
        assert_eq!(tiles.num_tiles(), 2);
        let t0 = tiles.yield_tile().unwrap().unwrap();
        assert_eq!(t0.bytes.len(), 16);
        assert_eq!(&t0.bytes[..4], &0u32.to_le_bytes());
        assert_eq!(&t0.bytes[12..], &3u32.to_le_bytes());
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn per_tile_codec_compresses_each_tile() {
        let bytes = vec![7u8; 4096];
        let mut tiles = SampleTiles::new(
            bytes,
            DataType::UInt(IntSize::b8),
            smallvec![4096],
            1024,
            Some(Compression::Gzip),
        );
        let t = tiles.yield_tile().unwrap().unwrap();
        assert!(t.bytes.len() < 1024);
        assert_eq!(Compression::Gzip.decompress(&t.bytes).unwrap(), vec![7u8; 1024]);
    }
}
