use std::borrow::Cow;

use crate::error::ChunkError;
use crate::meta::TensorMetaRef;
use crate::sample::{SampleValue, SampleView};
use crate::serialize::Serialized;
use crate::tiling::SampleTiles;
use crate::Htype;

use super::format::RawChunk;
use super::{Chunk, ChunkConfig, ChunkCore, Extend};

/// Chunk whose data block is the raw concatenation of per-sample bytes.
#[derive(Debug)]
pub struct UncompressedChunk {
    core: ChunkCore,
}

impl UncompressedChunk {
    pub fn new(config: ChunkConfig, meta: TensorMetaRef) -> Self {
        let convert = {
            let m = meta.read().expect("tensor meta lock poisoned");
            m.htype == Htype::Image
        };
        Self {
            core: ChunkCore::new(config, meta, convert),
        }
    }

    pub(crate) fn from_raw(
        raw: RawChunk,
        config: ChunkConfig,
        meta: TensorMetaRef,
    ) -> Result<Self, ChunkError> {
        let convert = {
            let m = meta.read().expect("tensor meta lock poisoned");
            m.htype == Htype::Image
        };
        Ok(Self {
            core: ChunkCore::from_raw(raw, config, meta, convert)?,
        })
    }

    pub(crate) fn core(&self) -> &ChunkCore {
        &self.core
    }
}

impl Chunk for UncompressedChunk {
    fn extend_if_has_space(&mut self, sample: SampleValue) -> Result<Extend, ChunkError> {
        self.core.prepare_for_write();
        let (serialized, shape) = self.core.serialize_value(sample, None, true)?;
        let bytes = match serialized {
            Serialized::Tiles(tiles) => return Ok(Extend::Tiled(tiles)),
            Serialized::Bytes(b) => b,
        };
        let shape = self.core.shape_or_flat(shape, bytes.len());
        if !self.core.can_fit_sample(bytes.len(), 0) {
            if !self.core.is_empty() {
                return Ok(Extend::Full);
            }
            // a lone sample may overflow min_chunk_size, but only untileable
            // payloads (raw bytes) can reach this point above the hard cap
            if bytes.len() > self.core.config.max_chunk_size {
                return Err(ChunkError::BudgetExceeded {
                    nbytes: bytes.len(),
                    max: self.core.config.max_chunk_size,
                });
            }
        }
        self.core
            .register_in_meta_and_headers(Some(bytes.len() as u64), &shape)?;
        self.core.append_data(&bytes);
        Ok(Extend::Admitted)
    }

    fn read_sample(&self, local_index: usize, copy: bool) -> Result<SampleView<'_>, ChunkError> {
        let idx = local_index as u64;
        let shape = self
            .core
            .shapes
            .get(idx)
            .cloned()
            .ok_or(ChunkError::SampleIndexOutOfRange(local_index))?;
        let (start, end) = self.core.sample_range(idx)?;
        let data = self.core.data.as_slice();
        if end > data.len() {
            return Err(ChunkError::format(
                &self.core.version,
                start,
                "byte range outside data block",
            ));
        }
        let bytes = &data[start..end];
        Ok(SampleView {
            dtype: self.core.dtype,
            shape,
            bytes: if copy {
                Cow::Owned(bytes.to_vec())
            } else {
                Cow::Borrowed(bytes)
            },
        })
    }

    fn update_sample(&mut self, local_index: usize, sample: SampleValue) -> Result<(), ChunkError> {
        self.core.prepare_for_write();
        let (serialized, shape) = self.core.serialize_value(sample, None, false)?;
        let bytes = match serialized {
            Serialized::Tiles(_) => {
                return Err(ChunkError::InvalidSampleType("tiled sample in update"))
            }
            Serialized::Bytes(b) => b,
        };
        let shape = self.core.shape_or_flat(shape, bytes.len());
        self.core.apply_update(local_index as u64, &bytes, shape)
    }

    fn write_tile(&mut self, tiles: &mut SampleTiles) -> Result<(), ChunkError> {
        self.core.prepare_for_write();
        debug_assert!(self.core.is_empty(), "tiles go into fresh chunks");
        let tile = tiles
            .yield_tile()?
            .expect("tile sequence already exhausted");
        if tile.is_first_write {
            let mut m = self.core.meta.write().expect("tensor meta lock poisoned");
            m.update_shape_interval(tiles.sample_shape())?;
            m.length += 1;
        }
        self.core
            .register_sample_to_headers(Some(tile.bytes.len() as u64), &tile.tile_shape);
        self.core.set_data(tile.bytes);
        Ok(())
    }

    fn tobytes(&self) -> Result<Vec<u8>, ChunkError> {
        Ok(self.core.tobytes_with(&[self.core.data.as_slice()]))
    }

    fn nbytes(&self) -> usize {
        self.core.nbytes_with(self.core.num_data_bytes())
    }

    fn num_samples(&self) -> u64 {
        self.core.num_samples()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::format::infer_chunk_num_bytes;
    use crate::dtype::{DataType, IntSize};
    use crate::meta::TensorMeta;
    use crate::sample::ScalarValue;
    use bytes::Bytes;
    use ndarray::{ArrayD, IxDyn};

    fn meta_u8() -> TensorMetaRef {
        TensorMeta::new(DataType::UInt(IntSize::b8), Htype::Generic).into_ref()
    }

    fn config() -> ChunkConfig {
        ChunkConfig {
            min_chunk_size: 512,
            max_chunk_size: 2048,
            convert_grayscale: true,
        }
    }

    fn grid(h: usize, w: usize, fill: u8) -> ArrayD<u8> {
        ArrayD::from_elem(IxDyn(&[h, w]), fill)
    }

    #[test]
    fn append_four_equal_arrays() {
        let meta = meta_u8();
        let mut chunk = UncompressedChunk::new(config(), meta.clone());
        for i in 0..4u8 {
            let out = chunk
                .extend_if_has_space(SampleValue::from_array(&grid(8, 8, i)))
                .unwrap();
            assert_eq!(out.num_admitted(), 1);
        }
        assert_eq!(chunk.num_samples(), 4);
        assert_eq!(chunk.core.num_data_bytes(), 256);
        assert_eq!(chunk.core.shapes.num_runs(), 1);
        assert_eq!(chunk.core.byte_positions.num_runs(), 1);
        assert_eq!(meta.read().unwrap().length, 4);

        let view = chunk.read_sample(2, false).unwrap();
        assert_eq!(view.shape.as_slice(), &[8, 8]);
        assert_eq!(view.as_bytes(), &[2u8; 64][..]);
        let arr: ArrayD<u8> = view.into_array(false).unwrap();
        assert_eq!(arr, grid(8, 8, 2));
    }

    #[test]
    fn mixed_shapes_split_runs() {
        let meta = meta_u8();
        let mut chunk = UncompressedChunk::new(config(), meta.clone());
        for i in 0..4u8 {
            chunk
                .extend_if_has_space(SampleValue::from_array(&grid(8, 8, i)))
                .unwrap();
        }
        chunk
            .extend_if_has_space(SampleValue::from_array(&grid(4, 4, 9)))
            .unwrap();
        assert_eq!(chunk.core.shapes.num_runs(), 2);
        assert_eq!(chunk.core.byte_positions.num_runs(), 2);
        let view = chunk.read_sample(4, true).unwrap();
        assert_eq!(view.shape.as_slice(), &[4, 4]);
        assert_eq!(view.as_bytes(), &[9u8; 16][..]);
        let m = meta.read().unwrap();
        assert_eq!(m.min_shape.as_slice(), &[4, 4]);
        assert_eq!(m.max_shape.as_slice(), &[8, 8]);
    }

    #[test]
    fn update_grows_sample_and_shifts_the_rest() {
        let meta = meta_u8();
        let mut chunk = UncompressedChunk::new(config(), meta);
        for i in 0..4u8 {
            chunk
                .extend_if_has_space(SampleValue::from_array(&grid(8, 8, i)))
                .unwrap();
        }
        chunk
            .extend_if_has_space(SampleValue::from_array(&grid(4, 4, 9)))
            .unwrap();

        let before: Vec<Vec<u8>> = (1..5)
            .map(|i| chunk.read_sample(i, true).unwrap().into_bytes())
            .collect();

        chunk
            .update_sample(0, SampleValue::from_array(&grid(10, 10, 7)))
            .unwrap();
        assert_eq!(chunk.core.num_data_bytes(), 308);
        assert_eq!(chunk.num_samples(), 5);

        let updated = chunk.read_sample(0, true).unwrap();
        assert_eq!(updated.shape.as_slice(), &[10, 10]);
        assert_eq!(updated.as_bytes(), &[7u8; 100][..]);
        // update isolation: every other sample reads back bit-identical
        for (i, old) in before.iter().enumerate() {
            assert_eq!(&chunk.read_sample(i + 1, true).unwrap().into_bytes(), old);
        }
    }

    #[test]
    fn update_rejects_dimensionality_change() {
        let mut chunk = UncompressedChunk::new(config(), meta_u8());
        chunk
            .extend_if_has_space(SampleValue::from_array(&grid(8, 8, 1)))
            .unwrap();
        let arr = ArrayD::from_elem(IxDyn(&[64]), 1u8);
        let err = chunk
            .update_sample(0, SampleValue::from_array(&arr))
            .unwrap_err();
        assert!(matches!(err, ChunkError::InvalidSampleShape { expected_ndim: 2, .. }));
        // chunk untouched
        assert_eq!(chunk.read_sample(0, true).unwrap().shape.as_slice(), &[8, 8]);
    }

    #[test]
    fn lone_sample_may_exceed_min_but_second_rotates() {
        let meta = meta_u8();
        let mut chunk = UncompressedChunk::new(config(), meta);
        let arr = ArrayD::from_elem(IxDyn(&[600]), 1u8);
        let out = chunk
            .extend_if_has_space(SampleValue::from_array(&arr))
            .unwrap();
        assert_eq!(out.num_admitted(), 1);

        let out = chunk
            .extend_if_has_space(SampleValue::from_array(&arr))
            .unwrap();
        assert_eq!(out.num_admitted(), 0);
        assert!(matches!(out, Extend::Full));
        assert_eq!(chunk.num_samples(), 1);
    }

    #[test]
    fn admission_stays_refused_until_bytes_shrink() {
        let mut chunk = UncompressedChunk::new(config(), meta_u8());
        while chunk
            .extend_if_has_space(SampleValue::from_array(&grid(10, 10, 1)))
            .unwrap()
            .num_admitted()
            == 1
        {}
        // refused once, refused for anything at least as large
        for extra in [100usize, 200, 512] {
            let arr = ArrayD::from_elem(IxDyn(&[extra]), 1u8);
            assert!(matches!(
                chunk.extend_if_has_space(SampleValue::from_array(&arr)).unwrap(),
                Extend::Full
            ));
        }
    }

    #[test]
    fn oversize_sample_returns_tiles_and_meta_updates_once() {
        let meta = meta_u8();
        let mut first = UncompressedChunk::new(config(), meta.clone());
        let arr = ArrayD::from_elem(IxDyn(&[3 * 2048]), 5u8);
        let mut tiles = match first
            .extend_if_has_space(SampleValue::from_array(&arr))
            .unwrap()
        {
            Extend::Tiled(t) => t,
            other => panic!("expected tiles, got {other:?}"),
        };
        assert!(first.core.is_empty());
        assert_eq!(tiles.num_tiles(), 3);

        let mut chunks = Vec::new();
        while !tiles.is_exhausted() {
            let mut c = UncompressedChunk::new(config(), meta.clone());
            c.write_tile(&mut tiles).unwrap();
            chunks.push(c);
        }
        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            assert_eq!(c.num_samples(), 1);
            assert_eq!(c.core.num_data_bytes(), 2048);
        }
        let m = meta.read().unwrap();
        assert_eq!(m.length, 1);
        assert_eq!(m.max_shape.as_slice(), &[3 * 2048]);
    }

    #[test]
    fn oversize_update_is_rejected() {
        let meta = meta_u8();
        let mut chunk = UncompressedChunk::new(config(), meta);
        chunk
            .extend_if_has_space(SampleValue::from_array(&grid(8, 8, 1)))
            .unwrap();

        // 64x64 = 4096 bytes, over the 2048 hard cap; updates cannot tile
        let err = chunk
            .update_sample(0, SampleValue::from_array(&grid(64, 64, 2)))
            .unwrap_err();
        assert!(matches!(err, ChunkError::BudgetExceeded { nbytes: 4096, max: 2048 }));

        // chunk untouched
        assert_eq!(chunk.num_samples(), 1);
        assert_eq!(chunk.core.num_data_bytes(), 64);
        let view = chunk.read_sample(0, true).unwrap();
        assert_eq!(view.shape.as_slice(), &[8, 8]);
        assert_eq!(view.as_bytes(), &[1u8; 64][..]);
    }

    #[test]
    fn raw_bytes_above_max_are_refused() {
        let mut chunk = UncompressedChunk::new(config(), meta_u8());
        let err = chunk
            .extend_if_has_space(SampleValue::Bytes(vec![0; 4096]))
            .unwrap_err();
        assert!(matches!(err, ChunkError::BudgetExceeded { nbytes: 4096, max: 2048 }));
        assert_eq!(chunk.num_samples(), 0);
    }

    #[test]
    fn scalar_appends_as_unit_sample() {
        let meta = TensorMeta::new(DataType::Int(IntSize::b32), Htype::Generic).into_ref();
        let mut chunk = UncompressedChunk::new(config(), meta);
        chunk
            .extend_if_has_space(SampleValue::Scalar(ScalarValue::Int(-3)))
            .unwrap();
        let view = chunk.read_sample(0, true).unwrap();
        assert_eq!(view.shape.as_slice(), &[1]);
        let arr: ArrayD<i32> = view.into_array(false).unwrap();
        assert_eq!(arr, ArrayD::from_elem(IxDyn(&[1]), -3));
    }

    #[test]
    fn text_roundtrip() {
        let meta = TensorMeta::new(DataType::UInt(IntSize::b8), Htype::Text).into_ref();
        let mut chunk = UncompressedChunk::new(config(), meta);
        chunk.extend_if_has_space("hello world".into()).unwrap();
        let view = chunk.read_sample(0, false).unwrap();
        assert_eq!(view.shape.as_slice(), &[11]);
        assert_eq!(view.to_text().unwrap(), "hello world");
    }

    #[test]
    fn serialized_roundtrip_preserves_samples() {
        let meta = meta_u8();
        let mut chunk = UncompressedChunk::new(config(), meta.clone());
        for i in 0..4u8 {
            chunk
                .extend_if_has_space(SampleValue::from_array(&grid(8, 8, i)))
                .unwrap();
        }
        let buf = chunk.tobytes().unwrap();
        assert_eq!(buf.len(), chunk.nbytes());
        assert_eq!(
            buf.len(),
            infer_chunk_num_bytes(
                &chunk.core.version,
                &chunk.core.shapes.to_table(),
                &chunk.core.byte_positions.to_table(),
                chunk.core.num_data_bytes()
            )
        );

        let back =
            UncompressedChunk::from_raw(
                crate::chunk::format::deserialize_chunk(&Bytes::from(buf), false).unwrap(),
                config(),
                meta,
            )
            .unwrap();
        assert_eq!(back.num_samples(), 4);
        for i in 0..4 {
            let a = chunk.read_sample(i, true).unwrap();
            let b = back.read_sample(i, true).unwrap();
            assert_eq!(a.shape, b.shape);
            assert_eq!(a.as_bytes(), b.as_bytes());
        }
    }

    #[test]
    fn grayscale_widens_when_tensor_is_3d() {
        let meta = TensorMeta::new(DataType::UInt(IntSize::b8), Htype::Image).into_ref();
        {
            let mut m = meta.write().unwrap();
            m.update_shape_interval(&smallvec::smallvec![8, 8, 3]).unwrap();
        }
        let mut chunk = UncompressedChunk::new(config(), meta);
        chunk
            .extend_if_has_space(SampleValue::from_array(&grid(8, 8, 1)))
            .unwrap();
        let view = chunk.read_sample(0, true).unwrap();
        assert_eq!(view.shape.as_slice(), &[8, 8, 1]);
    }
}
