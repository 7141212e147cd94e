use std::borrow::Cow;

use crate::compression::{decode_image, Compression};
use crate::error::ChunkError;
use crate::meta::TensorMetaRef;
use crate::sample::{SampleValue, SampleView};
use crate::serialize::Serialized;
use crate::tiling::SampleTiles;
use crate::Htype;

use super::format::RawChunk;
use super::{Chunk, ChunkConfig, ChunkCore, Extend};

/// Chunk whose samples are each compressed independently; the encoders mark
/// the boundaries of the compressed bytes.
#[derive(Debug)]
pub struct SampleCompressedChunk {
    core: ChunkCore,
    codec: Compression,
}

impl SampleCompressedChunk {
    pub fn new(config: ChunkConfig, meta: TensorMetaRef, codec: Compression) -> Self {
        let convert = codec.is_image() || {
            let m = meta.read().expect("tensor meta lock poisoned");
            m.htype == Htype::Image
        };
        Self {
            core: ChunkCore::new(config, meta, convert),
            codec,
        }
    }

    pub(crate) fn from_raw(
        raw: RawChunk,
        config: ChunkConfig,
        meta: TensorMetaRef,
        codec: Compression,
    ) -> Result<Self, ChunkError> {
        let convert = codec.is_image() || {
            let m = meta.read().expect("tensor meta lock poisoned");
            m.htype == Htype::Image
        };
        Ok(Self {
            core: ChunkCore::from_raw(raw, config, meta, convert)?,
            codec,
        })
    }

    pub(crate) fn core(&self) -> &ChunkCore {
        &self.core
    }

    /// Tiling never applies to image codecs: their blobs are indivisible.
    fn allow_tiling(&self) -> bool {
        self.codec.is_byte()
    }
}

impl Chunk for SampleCompressedChunk {
    fn extend_if_has_space(&mut self, sample: SampleValue) -> Result<Extend, ChunkError> {
        self.core.prepare_for_write();
        let allow_tiling = self.allow_tiling();
        let (serialized, shape) = self
            .core
            .serialize_value(sample, Some(self.codec), allow_tiling)?;
        let bytes = match serialized {
            Serialized::Tiles(tiles) => return Ok(Extend::Tiled(tiles)),
            Serialized::Bytes(b) => b,
        };
        let shape = self.core.shape_or_flat(shape, bytes.len());
        if !self.core.can_fit_sample(bytes.len(), 0) {
            if !self.core.is_empty() {
                return Ok(Extend::Full);
            }
            // image blobs are atoms and may exceed even the hard budget
            if bytes.len() > self.core.config.max_chunk_size && !self.codec.is_image() {
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
        let _ = copy; // decompression always yields an owned buffer
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
        let compressed = &data[start..end];
        let bytes = if self.codec.is_byte() {
            self.codec.decompress(compressed)?
        } else {
            decode_image(self.codec, compressed)?.bytes
        };
        Ok(SampleView {
            dtype: self.core.dtype,
            shape,
            bytes: Cow::Owned(bytes),
        })
    }

    fn update_sample(&mut self, local_index: usize, sample: SampleValue) -> Result<(), ChunkError> {
        self.core.prepare_for_write();
        let (serialized, shape) = self.core.serialize_value(sample, Some(self.codec), false)?;
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
