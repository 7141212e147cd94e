use std::borrow::Cow;
use std::cell::OnceCell;

use crate::compression::{decode_image, encode_image, Compression};
use crate::error::ChunkError;
use crate::meta::TensorMetaRef;
use crate::sample::{SampleValue, SampleView};
use crate::serialize::Serialized;
use crate::tiling::SampleTiles;
use crate::Htype;
use crate::SampleShape;

use super::format::RawChunk;
use super::{Chunk, ChunkConfig, ChunkCore, Extend};

#[derive(Debug, Clone)]
struct DecodedSample {
    bytes: Vec<u8>,
    shape: SampleShape,
}

/// Transient decompressed view of the chunk's data block.
#[derive(Debug)]
enum Cache {
    /// Byte codec: the whole decompressed stream. Byte positions refer to
    /// offsets in this stream, not in the compressed block.
    Bytes(Vec<u8>),
    /// Image codec: the decoded samples. Byte positions stay empty; sample
    /// boundaries are recovered from the image container itself.
    Samples(Vec<DecodedSample>),
}

/// Chunk whose data block is compressed as one unit: one byte stream, or
/// one image tile holding a single sample.
///
/// Writes land in the decompressed cache and mark the stored block stale;
/// `tobytes` recompresses. `nbytes` reflects the last compressed form and is
/// approximate between a write and the next `tobytes`.
#[derive(Debug)]
pub struct ChunkCompressedChunk {
    core: ChunkCore,
    codec: Compression,
    cache: OnceCell<Cache>,
}

impl ChunkCompressedChunk {
    pub fn new(config: ChunkConfig, meta: TensorMetaRef, codec: Compression) -> Self {
        let convert = codec.is_image() || {
            let m = meta.read().expect("tensor meta lock poisoned");
            m.htype == Htype::Image
        };
        Self {
            core: ChunkCore::new(config, meta, convert),
            codec,
            cache: OnceCell::new(),
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
            cache: OnceCell::new(),
        })
    }

    pub(crate) fn core(&self) -> &ChunkCore {
        &self.core
    }

    fn ensure_cache(&self) -> Result<(), ChunkError> {
        if self.cache.get().is_some() {
            return Ok(());
        }
        let stored = self.core.data.as_slice();
        let cache = if self.codec.is_byte() {
            let bytes = if stored.is_empty() {
                Vec::default()
            } else {
                self.codec.decompress(stored)?
            };
            Cache::Bytes(bytes)
        } else if stored.is_empty() {
            Cache::Samples(Vec::default())
        } else {
            let shape = self
                .core
                .shapes
                .get(0)
                .cloned()
                .ok_or_else(|| ChunkError::codec(self.codec, "image chunk without a shape"))?;
            let decoded = decode_image(self.codec, stored)?;
            Cache::Samples(vec![DecodedSample {
                bytes: decoded.bytes,
                shape,
            }])
        };
        let _ = self.cache.set(cache);
        Ok(())
    }

    fn bytes_cache(&self) -> Result<&Vec<u8>, ChunkError> {
        self.ensure_cache()?;
        match self.cache.get() {
            Some(Cache::Bytes(b)) => Ok(b),
            _ => Err(ChunkError::codec(self.codec, "expected a byte-compressed chunk")),
        }
    }

    fn bytes_cache_mut(&mut self) -> Result<&mut Vec<u8>, ChunkError> {
        self.ensure_cache()?;
        match self.cache.get_mut() {
            Some(Cache::Bytes(b)) => Ok(b),
            _ => Err(ChunkError::codec(self.codec, "expected a byte-compressed chunk")),
        }
    }

    fn samples_cache(&self) -> Result<&Vec<DecodedSample>, ChunkError> {
        self.ensure_cache()?;
        match self.cache.get() {
            Some(Cache::Samples(s)) => Ok(s),
            _ => Err(ChunkError::codec(self.codec, "expected an image-compressed chunk")),
        }
    }

    fn samples_cache_mut(&mut self) -> Result<&mut Vec<DecodedSample>, ChunkError> {
        self.ensure_cache()?;
        match self.cache.get_mut() {
            Some(Cache::Samples(s)) => Ok(s),
            _ => Err(ChunkError::codec(self.codec, "expected an image-compressed chunk")),
        }
    }

    /// Size of the decompressed payload, which is what admission budgets.
    fn payload_len(&self) -> Result<usize, ChunkError> {
        if self.codec.is_byte() {
            Ok(self.bytes_cache()?.len())
        } else {
            Ok(self
                .samples_cache()?
                .iter()
                .map(|s| s.bytes.len())
                .sum())
        }
    }

    fn extend_byte(&mut self, sample: SampleValue) -> Result<Extend, ChunkError> {
        let (serialized, shape) = self.core.serialize_value(sample, None, true)?;
        let bytes = match serialized {
            Serialized::Tiles(tiles) => return Ok(Extend::Tiled(tiles)),
            Serialized::Bytes(b) => b,
        };
        let shape = self.core.shape_or_flat(shape, bytes.len());
        let payload = self.payload_len()?;
        if payload + bytes.len() >= self.core.config.min_chunk_size && !self.core.is_empty() {
            return Ok(Extend::Full);
        }
        self.core
            .register_in_meta_and_headers(Some(bytes.len() as u64), &shape)?;
        self.bytes_cache_mut()?.extend_from_slice(&bytes);
        Ok(Extend::Admitted)
    }

    fn extend_image(&mut self, sample: SampleValue) -> Result<Extend, ChunkError> {
        // one sample per chunk: boundaries cannot be recovered otherwise
        if !self.core.is_empty() {
            return Ok(Extend::Full);
        }
        let (serialized, shape) = self.core.serialize_value(sample, None, false)?;
        let bytes = match serialized {
            Serialized::Tiles(_) => {
                return Err(ChunkError::InvalidSampleType(
                    "tiled sample under image chunk compression",
                ))
            }
            Serialized::Bytes(b) => b,
        };
        let shape = self.core.shape_or_flat(shape, bytes.len());
        self.core.register_in_meta_and_headers(None, &shape)?;
        let samples = self.samples_cache_mut()?;
        samples.clear();
        samples.push(DecodedSample { bytes, shape });
        Ok(Extend::Admitted)
    }
}

impl Chunk for ChunkCompressedChunk {
    fn extend_if_has_space(&mut self, sample: SampleValue) -> Result<Extend, ChunkError> {
        self.core.prepare_for_write();
        if self.codec.is_byte() {
            self.extend_byte(sample)
        } else {
            self.extend_image(sample)
        }
    }

    fn read_sample(&self, local_index: usize, copy: bool) -> Result<SampleView<'_>, ChunkError> {
        let idx = local_index as u64;
        let shape = self
            .core
            .shapes
            .get(idx)
            .cloned()
            .ok_or(ChunkError::SampleIndexOutOfRange(local_index))?;
        let bytes: &[u8] = if self.codec.is_byte() {
            let (start, end) = self.core.sample_range(idx)?;
            let cache = self.bytes_cache()?;
            if end > cache.len() {
                return Err(ChunkError::format(
                    &self.core.version,
                    start,
                    "byte range outside data block",
                ));
            }
            &cache[start..end]
        } else {
            &self
                .samples_cache()?
                .get(local_index)
                .ok_or(ChunkError::SampleIndexOutOfRange(local_index))?
                .bytes
        };
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
        let idx = local_index as u64;
        let (serialized, shape) = self.core.serialize_value(sample, None, false)?;
        let bytes = match serialized {
            Serialized::Tiles(_) => {
                return Err(ChunkError::InvalidSampleType("tiled sample in update"))
            }
            Serialized::Bytes(b) => b,
        };
        let shape = self.core.shape_or_flat(shape, bytes.len());
        self.core.check_shape_for_update(idx, &shape)?;

        if self.codec.is_byte() {
            let (start, end) = self.core.sample_range(idx)?;
            let cache = self.bytes_cache_mut()?;
            let total = cache.len() - (end - start) + bytes.len();
            let mut out = Vec::with_capacity(total);
            out.extend_from_slice(&cache[..start]);
            out.extend_from_slice(&bytes);
            out.extend_from_slice(&cache[end..]);
            *cache = out;
            self.core
                .update_in_meta_and_headers(idx, Some(bytes.len() as u64), &shape)
        } else {
            let samples = self.samples_cache_mut()?;
            let slot = samples
                .get_mut(local_index)
                .ok_or(ChunkError::SampleIndexOutOfRange(local_index))?;
            *slot = DecodedSample {
                bytes,
                shape: shape.clone(),
            };
            self.core.update_in_meta_and_headers(idx, None, &shape)
        }
    }

    fn write_tile(&mut self, tiles: &mut SampleTiles) -> Result<(), ChunkError> {
        if self.codec.is_image() {
            return Err(ChunkError::InvalidSampleType(
                "tiled sample under image chunk compression",
            ));
        }
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
        self.ensure_cache()?;
        match self.cache.get_mut() {
            Some(Cache::Bytes(b)) => *b = tile.bytes,
            _ => return Err(ChunkError::codec(self.codec, "expected a byte-compressed chunk")),
        }
        Ok(())
    }

    fn tobytes(&self) -> Result<Vec<u8>, ChunkError> {
        let data = match self.cache.get() {
            // never written nor read: the stored block is authoritative
            None => self.core.data.as_slice().to_vec(),
            Some(Cache::Bytes(b)) => self.codec.compress(b)?,
            Some(Cache::Samples(samples)) => match samples.first() {
                None => Vec::default(),
                Some(s) => encode_image(self.codec, &s.bytes, &s.shape, self.core.dtype)?,
            },
        };
        Ok(self.core.tobytes_with(&[&data]))
    }

    fn nbytes(&self) -> usize {
        self.core.nbytes_with(self.core.num_data_bytes())
    }

    fn num_samples(&self) -> u64 {
        self.core.num_samples()
    }
}
