//! The chunk: a self-describing, append-mostly container of samples with a
//! versioned header, two run-length encoders and a contiguous data block.

use bytes::Bytes;
use log::warn;

use crate::compression::Compression;
use crate::dtype::{DataType, Htype};
use crate::encode::{BytePositionsEncoder, ShapeEncoder};
use crate::error::ChunkError;
use crate::meta::TensorMetaRef;
use crate::sample::{SampleValue, SampleView};
use crate::serialize::{serialize_sample, Serialized, SerializeContext};
use crate::tiling::SampleTiles;
use crate::{MaybeNdim, SampleShape};

pub mod chunk_compressed;
pub mod fast_forward;
pub mod format;
pub mod sample_compressed;
pub mod uncompressed;

pub use chunk_compressed::ChunkCompressedChunk;
pub use sample_compressed::SampleCompressedChunk;
pub use uncompressed::UncompressedChunk;

use format::RawChunk;

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_MIN_CHUNK_SIZE: usize = DEFAULT_MAX_CHUNK_SIZE / 2;

/// Per-chunk settings, passed explicitly at construction.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Admission budget: a chunk stops accepting further samples once its
    /// data block would reach this size.
    pub min_chunk_size: usize,
    /// Hard budget: a single serialized sample above this size is tiled (or
    /// admitted alone, for indivisible blobs).
    pub max_chunk_size: usize,
    /// Widen 2-D grayscale images to `(H, W, 1)` when the tensor is 3-D.
    pub convert_grayscale: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            convert_grayscale: true,
        }
    }
}

/// Outcome of an admission attempt.
///
/// `Full` is the normal rotate signal, not an error. `Tiled` carries the
/// handle for a sample too large for any single chunk; the caller drains it
/// with [Chunk::write_tile] over consecutive fresh chunks.
#[derive(Debug)]
pub enum Extend {
    Admitted,
    Full,
    Tiled(SampleTiles),
}

impl Extend {
    /// Numeric admission count: 1 when admitted, 0 otherwise.
    pub fn num_admitted(&self) -> usize {
        matches!(self, Self::Admitted) as usize
    }
}

/// The chunk's data block, either owned and growable or a read-only view
/// into the buffer the chunk was parsed from.
#[derive(Debug, Clone)]
pub(crate) enum DataBlock {
    Owned(Vec<u8>),
    Borrowed(Bytes),
}

impl DataBlock {
    fn len(&self) -> usize {
        match self {
            Self::Owned(v) => v.len(),
            Self::Borrowed(b) => b.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(v) => v,
            Self::Borrowed(b) => b,
        }
    }

    /// Copies a borrowed view into an owned buffer; a no-op when already
    /// owned. Called once, by `prepare_for_write`.
    fn make_owned(&mut self) {
        if let Self::Borrowed(b) = self {
            *self = Self::Owned(b.to_vec());
        }
    }

    fn owned_mut(&mut self) -> &mut Vec<u8> {
        self.make_owned();
        match self {
            Self::Owned(v) => v,
            Self::Borrowed(_) => unreachable!("data block was just made owned"),
        }
    }
}

/// Shared state of every chunk variant: version tag, both encoders, the
/// data block and the borrowed tensor descriptor.
#[derive(Debug)]
pub struct ChunkCore {
    pub(crate) version: String,
    pub(crate) config: ChunkConfig,
    pub(crate) meta: TensorMetaRef,
    pub(crate) dtype: DataType,
    pub(crate) htype: Htype,
    pub(crate) shapes: ShapeEncoder,
    pub(crate) byte_positions: BytePositionsEncoder,
    pub(crate) data: DataBlock,
    pub(crate) num_dims: Option<usize>,
    convert_candidate: bool,
    grayscale_warned: bool,
}

impl ChunkCore {
    pub(crate) fn new(config: ChunkConfig, meta: TensorMetaRef, convert_candidate: bool) -> Self {
        let (dtype, htype, num_dims) = {
            let m = meta.read().expect("tensor meta lock poisoned");
            (m.dtype, m.htype, m.maybe_ndim())
        };
        Self {
            version: crate::CHUNK_FORMAT_VERSION.to_owned(),
            config,
            meta,
            dtype,
            htype,
            shapes: ShapeEncoder::new(),
            byte_positions: BytePositionsEncoder::new(),
            data: DataBlock::Owned(Vec::default()),
            num_dims,
            convert_candidate,
            grayscale_warned: false,
        }
    }

    pub(crate) fn from_raw(
        raw: RawChunk,
        config: ChunkConfig,
        meta: TensorMetaRef,
        convert_candidate: bool,
    ) -> Result<Self, ChunkError> {
        let mut core = Self::new(config, meta, convert_candidate);
        core.shapes = fast_forward::decode_shape_table(&raw.version, &raw.shapes)?;
        core.byte_positions =
            fast_forward::decode_byte_positions_table(&raw.version, &raw.byte_positions)?;
        core.version = raw.version;
        core.data = DataBlock::Borrowed(raw.data);
        if core.num_dims.is_none() {
            core.num_dims = core.shapes.ndim();
        }
        Ok(core)
    }

    pub(crate) fn num_samples(&self) -> u64 {
        self.shapes.num_samples()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }

    pub(crate) fn num_data_bytes(&self) -> usize {
        self.data.len()
    }

    /// Strict admission test: the data block may reach, but never exceed,
    /// `min_chunk_size` through further admissions.
    pub(crate) fn can_fit_sample(&self, sample_nbytes: usize, buffer_nbytes: usize) -> bool {
        buffer_nbytes + sample_nbytes + self.num_data_bytes() < self.config.min_chunk_size
    }

    /// Upgrades older formats and materializes the data block for mutation.
    pub(crate) fn prepare_for_write(&mut self) {
        fast_forward::fast_forward_chunk(self);
        self.data.make_owned();
    }

    pub(crate) fn serialize_value(
        &mut self,
        value: SampleValue,
        sample_compression: Option<Compression>,
        allow_tiling: bool,
    ) -> Result<(Serialized, Option<SampleShape>), ChunkError> {
        let ctx = SerializeContext {
            dtype: self.dtype,
            htype: self.htype,
            sample_compression,
            max_chunk_size: self.config.max_chunk_size,
            allow_tiling,
        };
        let (serialized, shape) = serialize_sample(value, &ctx)?;
        Ok((serialized, shape.map(|s| self.convert_to_rgb(s))))
    }

    /// Widens a 2-D grayscale shape to `(H, W, 1)` for image data in a 3-D
    /// tensor, warning once per chunk.
    fn convert_to_rgb(&mut self, mut shape: SampleShape) -> SampleShape {
        if self.convert_candidate && self.config.convert_grayscale {
            if self.num_dims.is_none() {
                self.num_dims = Some(shape.len());
            }
            if shape.len() == 2 && self.num_dims == Some(3) {
                if !self.grayscale_warned {
                    warn!(
                        "Grayscale images will be reshaped from (H, W) to (H, W, 1) \
                         to match tensor dimensions. This warning will be shown only once."
                    );
                    self.grayscale_warned = true;
                }
                shape.push(1);
            }
        }
        shape
    }

    /// Serializer output for raw-bytes samples carries no shape; such
    /// samples register as one flat run of bytes.
    pub(crate) fn shape_or_flat(&self, shape: Option<SampleShape>, nbytes: usize) -> SampleShape {
        shape.unwrap_or_else(|| smallvec::smallvec![nbytes as u64])
    }

    pub(crate) fn register_sample_to_headers(
        &mut self,
        incoming_num_bytes: Option<u64>,
        sample_shape: &SampleShape,
    ) {
        self.shapes.register_samples(sample_shape, 1);
        // byte positions are not tracked for image-compressed chunk data
        if let Some(nbytes) = incoming_num_bytes {
            self.byte_positions.register_samples(nbytes, 1);
        }
    }

    /// Registers a new sample in the tensor descriptor and both headers.
    ///
    /// The descriptor update runs first: it is the only fallible step, so a
    /// dimensionality mismatch leaves the chunk untouched.
    pub(crate) fn register_in_meta_and_headers(
        &mut self,
        sample_nbytes: Option<u64>,
        shape: &SampleShape,
    ) -> Result<(), ChunkError> {
        {
            let mut m = self.meta.write().expect("tensor meta lock poisoned");
            m.update_shape_interval(shape)?;
            m.length += 1;
        }
        self.register_sample_to_headers(sample_nbytes, shape);
        if self.num_dims.is_none() {
            self.num_dims = Some(shape.len());
        }
        Ok(())
    }

    /// Re-registers an existing sample after an in-place update.
    pub(crate) fn update_in_meta_and_headers(
        &mut self,
        local_index: u64,
        sample_nbytes: Option<u64>,
        shape: &SampleShape,
    ) -> Result<(), ChunkError> {
        {
            let mut m = self.meta.write().expect("tensor meta lock poisoned");
            m.update_shape_interval(shape)?;
        }
        if let Some(nbytes) = sample_nbytes {
            self.byte_positions.set(local_index, nbytes);
        }
        self.shapes.set(local_index, shape.clone());
        Ok(())
    }

    /// An updated sample must keep the dimensionality it was written with.
    pub(crate) fn check_shape_for_update(
        &self,
        local_index: u64,
        shape: &SampleShape,
    ) -> Result<(), ChunkError> {
        let expected = self
            .shapes
            .get(local_index)
            .ok_or(ChunkError::SampleIndexOutOfRange(local_index as usize))?
            .len();
        if expected != shape.len() {
            return Err(ChunkError::InvalidSampleShape {
                expected_ndim: expected,
                shape: shape.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn sample_range(&self, local_index: u64) -> Result<(usize, usize), ChunkError> {
        self.byte_positions
            .get(local_index)
            .map(|(s, e)| (s as usize, e as usize))
            .ok_or(ChunkError::SampleIndexOutOfRange(local_index as usize))
    }

    pub(crate) fn append_data(&mut self, bytes: &[u8]) {
        self.data.owned_mut().extend_from_slice(bytes);
    }

    pub(crate) fn set_data(&mut self, bytes: Vec<u8>) {
        self.data = DataBlock::Owned(bytes);
    }

    /// Replaces the byte range `[start, end)` with `new_bytes`, allocating
    /// the final buffer once.
    pub(crate) fn splice_data(&mut self, start: usize, end: usize, new_bytes: &[u8]) {
        let old = self.data.as_slice();
        let total = old.len() - (end - start) + new_bytes.len();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&old[..start]);
        out.extend_from_slice(new_bytes);
        out.extend_from_slice(&old[end..]);
        self.data = DataBlock::Owned(out);
    }

    /// Common in-place update path: validate, splice, re-register.
    pub(crate) fn apply_update(
        &mut self,
        local_index: u64,
        new_bytes: &[u8],
        shape: SampleShape,
    ) -> Result<(), ChunkError> {
        self.check_shape_for_update(local_index, &shape)?;
        let (start, end) = self.sample_range(local_index)?;
        self.splice_data(start, end, new_bytes);
        self.update_in_meta_and_headers(local_index, Some(new_bytes.len() as u64), &shape)
    }

    pub(crate) fn tobytes_with(&self, data_parts: &[&[u8]]) -> Vec<u8> {
        format::serialize_chunk(
            &self.version,
            &self.shapes.to_table(),
            &self.byte_positions.to_table(),
            data_parts,
        )
    }

    pub(crate) fn nbytes_with(&self, len_data: usize) -> usize {
        format::infer_chunk_num_bytes(
            &self.version,
            &self.shapes.to_table(),
            &self.byte_positions.to_table(),
            len_data,
        )
    }
}

/// Capability set shared by every chunk variant.
pub trait Chunk {
    /// Serializes `sample`, tests admission, and appends on success.
    ///
    /// Returns [Extend::Full] when the caller must rotate to a fresh chunk
    /// and [Extend::Tiled] when the sample needs to span several chunks.
    fn extend_if_has_space(&mut self, sample: SampleValue) -> Result<Extend, ChunkError>;

    /// Reads one sample. With `copy == false` the view borrows the chunk's
    /// data block where possible and must be dropped before the next
    /// mutating call.
    fn read_sample(&self, local_index: usize, copy: bool) -> Result<SampleView<'_>, ChunkError>;

    /// Replaces sample `local_index` in place. Atomic: on error the
    /// encoders and data block are unchanged.
    fn update_sample(&mut self, local_index: usize, sample: SampleValue) -> Result<(), ChunkError>;

    /// Consumes the next tile of an oversize sample into this (fresh)
    /// chunk. The tensor descriptor is touched only by the first tile.
    fn write_tile(&mut self, tiles: &mut SampleTiles) -> Result<(), ChunkError>;

    /// Serializes the whole chunk into one contiguous buffer.
    fn tobytes(&self) -> Result<Vec<u8>, ChunkError>;

    /// Exact size `tobytes` would produce, without materializing it.
    fn nbytes(&self) -> usize;

    fn num_samples(&self) -> u64;
}

/// A chunk of any compression mode, dispatching the capability set.
#[derive(Debug)]
pub enum ChunkVariant {
    Uncompressed(UncompressedChunk),
    SampleCompressed(SampleCompressedChunk),
    ChunkCompressed(ChunkCompressedChunk),
}

impl ChunkVariant {
    /// Fresh chunk; the variant follows the tensor's codec settings.
    pub fn new(config: ChunkConfig, meta: TensorMetaRef) -> Self {
        let (sample_compression, chunk_compression) = {
            let m = meta.read().expect("tensor meta lock poisoned");
            (m.sample_compression, m.chunk_compression)
        };
        if let Some(codec) = chunk_compression {
            Self::ChunkCompressed(ChunkCompressedChunk::new(config, meta, codec))
        } else if let Some(codec) = sample_compression {
            Self::SampleCompressed(SampleCompressedChunk::new(config, meta, codec))
        } else {
            Self::Uncompressed(UncompressedChunk::new(config, meta))
        }
    }

    /// Parses a serialized chunk. An empty buffer yields a fresh chunk.
    ///
    /// With `copy == false` the chunk's data block stays a view into `buf`
    /// until the first mutating call.
    pub fn frombuffer(
        buf: Bytes,
        copy: bool,
        config: ChunkConfig,
        meta: TensorMetaRef,
    ) -> Result<Self, ChunkError> {
        if buf.is_empty() {
            return Ok(Self::new(config, meta));
        }
        let raw = format::deserialize_chunk(&buf, copy)?;
        let (sample_compression, chunk_compression) = {
            let m = meta.read().expect("tensor meta lock poisoned");
            (m.sample_compression, m.chunk_compression)
        };
        let out = if let Some(codec) = chunk_compression {
            Self::ChunkCompressed(ChunkCompressedChunk::from_raw(raw, config, meta, codec)?)
        } else if let Some(codec) = sample_compression {
            Self::SampleCompressed(SampleCompressedChunk::from_raw(raw, config, meta, codec)?)
        } else {
            Self::Uncompressed(UncompressedChunk::from_raw(raw, config, meta)?)
        };
        Ok(out)
    }

    /// Defensive clone: a round trip through the wire form.
    pub fn copy(&self) -> Result<Self, ChunkError> {
        let (config, meta) = match self {
            Self::Uncompressed(c) => (c.core().config.clone(), c.core().meta.clone()),
            Self::SampleCompressed(c) => (c.core().config.clone(), c.core().meta.clone()),
            Self::ChunkCompressed(c) => (c.core().config.clone(), c.core().meta.clone()),
        };
        Self::frombuffer(Bytes::from(self.tobytes()?), true, config, meta)
    }
}

impl Chunk for ChunkVariant {
    fn extend_if_has_space(&mut self, sample: SampleValue) -> Result<Extend, ChunkError> {
        match self {
            Self::Uncompressed(c) => c.extend_if_has_space(sample),
            Self::SampleCompressed(c) => c.extend_if_has_space(sample),
            Self::ChunkCompressed(c) => c.extend_if_has_space(sample),
        }
    }

    fn read_sample(&self, local_index: usize, copy: bool) -> Result<SampleView<'_>, ChunkError> {
        match self {
            Self::Uncompressed(c) => c.read_sample(local_index, copy),
            Self::SampleCompressed(c) => c.read_sample(local_index, copy),
            Self::ChunkCompressed(c) => c.read_sample(local_index, copy),
        }
    }

    fn update_sample(&mut self, local_index: usize, sample: SampleValue) -> Result<(), ChunkError> {
        match self {
            Self::Uncompressed(c) => c.update_sample(local_index, sample),
            Self::SampleCompressed(c) => c.update_sample(local_index, sample),
            Self::ChunkCompressed(c) => c.update_sample(local_index, sample),
        }
    }

    fn write_tile(&mut self, tiles: &mut SampleTiles) -> Result<(), ChunkError> {
        match self {
            Self::Uncompressed(c) => c.write_tile(tiles),
            Self::SampleCompressed(c) => c.write_tile(tiles),
            Self::ChunkCompressed(c) => c.write_tile(tiles),
        }
    }

    fn tobytes(&self) -> Result<Vec<u8>, ChunkError> {
        match self {
            Self::Uncompressed(c) => c.tobytes(),
            Self::SampleCompressed(c) => c.tobytes(),
            Self::ChunkCompressed(c) => c.tobytes(),
        }
    }

    fn nbytes(&self) -> usize {
        match self {
            Self::Uncompressed(c) => c.nbytes(),
            Self::SampleCompressed(c) => c.nbytes(),
            Self::ChunkCompressed(c) => c.nbytes(),
        }
    }

    fn num_samples(&self) -> u64 {
        match self {
            Self::Uncompressed(c) => c.num_samples(),
            Self::SampleCompressed(c) => c.num_samples(),
            Self::ChunkCompressed(c) => c.num_samples(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::IntSize;
    use crate::meta::TensorMeta;
    use ndarray::{ArrayD, IxDyn};

    fn meta_u8() -> TensorMetaRef {
        TensorMeta::new(DataType::UInt(IntSize::b8), Htype::Generic).into_ref()
    }

    #[test]
    fn variant_follows_tensor_codec_settings() {
        let plain = ChunkVariant::new(ChunkConfig::default(), meta_u8());
        assert!(matches!(plain, ChunkVariant::Uncompressed(_)));

        #[cfg(feature = "gzip")]
        {
            let meta = TensorMeta::new(DataType::UInt(IntSize::b8), Htype::Generic)
                .with_sample_compression(Compression::Gzip)
                .into_ref();
            assert!(matches!(
                ChunkVariant::new(ChunkConfig::default(), meta),
                ChunkVariant::SampleCompressed(_)
            ));

            let meta = TensorMeta::new(DataType::UInt(IntSize::b8), Htype::Generic)
                .with_chunk_compression(Compression::Gzip)
                .into_ref();
            assert!(matches!(
                ChunkVariant::new(ChunkConfig::default(), meta),
                ChunkVariant::ChunkCompressed(_)
            ));
        }
    }

    #[test]
    fn empty_buffer_yields_a_fresh_chunk() {
        let chunk =
            ChunkVariant::frombuffer(Bytes::new(), false, ChunkConfig::default(), meta_u8())
                .unwrap();
        assert_eq!(chunk.num_samples(), 0);
    }

    #[test]
    fn copy_is_a_wire_roundtrip() {
        let mut chunk = ChunkVariant::new(ChunkConfig::default(), meta_u8());
        let arr = ArrayD::from_shape_vec(IxDyn(&[2, 5]), (0u8..10).collect::<Vec<_>>()).unwrap();
        chunk
            .extend_if_has_space(SampleValue::from_array(&arr))
            .unwrap();

        let cloned = chunk.copy().unwrap();
        assert_eq!(cloned.num_samples(), 1);
        let a = chunk.read_sample(0, true).unwrap();
        let b = cloned.read_sample(0, true).unwrap();
        assert_eq!(a.shape, b.shape);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(chunk.tobytes().unwrap(), cloned.tobytes().unwrap());
    }
}
