//! Converts an incoming [SampleValue] into bytes under a chunk's dtype,
//! htype and codec settings.

use smallvec::smallvec;

use crate::compression::{encode_image, Compression};
use crate::dtype::{DataType, Htype};
use crate::error::ChunkError;
use crate::sample::{NumericArray, PreparedSample, SampleValue};
use crate::tiling::SampleTiles;
use crate::SampleShape;

/// Per-chunk settings the serializer needs; assembled by the chunk variant.
#[derive(Debug, Clone)]
pub(crate) struct SerializeContext {
    pub dtype: DataType,
    pub htype: Htype,
    /// Codec applied to each serialized sample, if the chunk compresses
    /// per sample.
    pub sample_compression: Option<Compression>,
    pub max_chunk_size: usize,
    /// Whether oversize samples may be split across chunks. False for
    /// image-compressed data, whose blobs are indivisible.
    pub allow_tiling: bool,
}

/// Serializer output: either one buffer or a tiling handle for a sample too
/// large for any single chunk.
#[derive(Debug)]
pub(crate) enum Serialized {
    Bytes(Vec<u8>),
    Tiles(SampleTiles),
}

pub(crate) type SerializedOutput = (Serialized, Option<SampleShape>);

/// `()` registers as `(1,)`.
pub(crate) fn normalize_shape(shape: SampleShape) -> SampleShape {
    if shape.is_empty() {
        smallvec![1]
    } else {
        shape
    }
}

pub(crate) fn serialize_sample(
    value: SampleValue,
    ctx: &SerializeContext,
) -> Result<SerializedOutput, ChunkError> {
    if ctx.htype.is_text_like()
        && matches!(
            value,
            SampleValue::Numeric(_) | SampleValue::Scalar(_) | SampleValue::Prepared(_)
        )
    {
        // text-like tensors only hold text, json or pre-serialized payloads
        return Err(ChunkError::InvalidSampleType(value.type_name()));
    }
    match value {
        SampleValue::Text(s) => {
            let bytes = s.into_bytes();
            let shape = smallvec![bytes.len() as u64];
            Ok((byte_compressed(bytes, ctx)?, Some(shape)))
        }
        SampleValue::Json(v) => {
            let bytes = serde_json::to_vec(&v)
                .map_err(|_| ChunkError::InvalidSampleType("unserializable json"))?;
            Ok((byte_compressed(bytes, ctx)?, Some(smallvec![1])))
        }
        SampleValue::List(items) => {
            let shape = smallvec![items.len() as u64];
            let bytes = serde_json::to_vec(&items)
                .map_err(|_| ChunkError::InvalidSampleType("unserializable list"))?;
            Ok((byte_compressed(bytes, ctx)?, Some(shape)))
        }
        SampleValue::Bytes(b) => Ok((Serialized::Bytes(b), None)),
        SampleValue::Scalar(s) => serialize_numeric(s.to_numeric(), ctx),
        SampleValue::Numeric(arr) => serialize_numeric(arr, ctx),
        SampleValue::Prepared(p) => serialize_prepared(p, ctx),
        SampleValue::Tiles(t) => {
            let shape = t.sample_shape().clone();
            Ok((Serialized::Tiles(t), Some(shape)))
        }
    }
}

/// Applies the chunk's byte codec to a text-like payload. Image codecs do
/// not apply to text.
fn byte_compressed(bytes: Vec<u8>, ctx: &SerializeContext) -> Result<Serialized, ChunkError> {
    match ctx.sample_compression {
        Some(codec) if codec.is_byte() => Ok(Serialized::Bytes(codec.compress(&bytes)?)),
        _ => Ok(Serialized::Bytes(bytes)),
    }
}

fn serialize_numeric(
    arr: NumericArray,
    ctx: &SerializeContext,
) -> Result<SerializedOutput, ChunkError> {
    let raw = arr.cast(ctx.dtype)?.into_owned();
    let shape = normalize_shape(arr.shape().clone());

    match ctx.sample_compression {
        Some(codec) if codec.is_image() => {
            // image blobs are indivisible; size is the admission test's call
            let encoded = encode_image(codec, &raw, &shape, ctx.dtype)?;
            Ok((Serialized::Bytes(encoded), Some(shape)))
        }
        Some(codec) => {
            let compressed = codec.compress(&raw)?;
            if compressed.len() > ctx.max_chunk_size {
                check_tileable(compressed.len(), ctx)?;
                let tiles =
                    SampleTiles::new(raw, ctx.dtype, shape.clone(), ctx.max_chunk_size, Some(codec));
                Ok((Serialized::Tiles(tiles), Some(shape)))
            } else {
                Ok((Serialized::Bytes(compressed), Some(shape)))
            }
        }
        None => {
            if raw.len() > ctx.max_chunk_size {
                check_tileable(raw.len(), ctx)?;
                let tiles =
                    SampleTiles::new(raw, ctx.dtype, shape.clone(), ctx.max_chunk_size, None);
                Ok((Serialized::Tiles(tiles), Some(shape)))
            } else {
                Ok((Serialized::Bytes(raw), Some(shape)))
            }
        }
    }
}

/// A payload over the hard budget must tile; where tiling is unavailable
/// (updates, image chunk compression) it is refused outright.
fn check_tileable(nbytes: usize, ctx: &SerializeContext) -> Result<(), ChunkError> {
    if ctx.allow_tiling {
        Ok(())
    } else {
        Err(ChunkError::BudgetExceeded {
            nbytes,
            max: ctx.max_chunk_size,
        })
    }
}

fn serialize_prepared(
    p: PreparedSample,
    ctx: &SerializeContext,
) -> Result<SerializedOutput, ChunkError> {
    let shape = normalize_shape(p.shape().clone());
    match ctx.sample_compression {
        Some(codec) if codec.is_image() => {
            if p.compression() == codec {
                // already in the chunk's format; store the blob as-is
                Ok((Serialized::Bytes(p.into_encoded()), Some(shape)))
            } else {
                let dtype = p.dtype();
                let raw = p.decoded_bytes()?;
                let encoded = encode_image(codec, &raw, &shape, dtype)?;
                Ok((Serialized::Bytes(encoded), Some(shape)))
            }
        }
        Some(codec) => {
            let raw = p.decoded_bytes()?;
            let cast = if p.dtype() == ctx.dtype {
                raw
            } else {
                crate::dtype::cast_bytes(&raw, p.dtype(), ctx.dtype)?
            };
            let compressed = codec.compress(&cast)?;
            if compressed.len() > ctx.max_chunk_size {
                check_tileable(compressed.len(), ctx)?;
                let tiles =
                    SampleTiles::new(cast, ctx.dtype, shape.clone(), ctx.max_chunk_size, Some(codec));
                Ok((Serialized::Tiles(tiles), Some(shape)))
            } else {
                Ok((Serialized::Bytes(compressed), Some(shape)))
            }
        }
        None => {
            let raw = p.decoded_bytes()?;
            let cast = if p.dtype() == ctx.dtype {
                raw
            } else {
                crate::dtype::cast_bytes(&raw, p.dtype(), ctx.dtype)?
            };
            if cast.len() > ctx.max_chunk_size {
                check_tileable(cast.len(), ctx)?;
                let tiles =
                    SampleTiles::new(cast, ctx.dtype, shape.clone(), ctx.max_chunk_size, None);
                Ok((Serialized::Tiles(tiles), Some(shape)))
            } else {
                Ok((Serialized::Bytes(cast), Some(shape)))
            }
        }
    }
}
