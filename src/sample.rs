use std::borrow::Cow;

use ndarray::{ArrayD, IxDyn};

use crate::compression::{decode_image, Compression};
use crate::dtype::{cast_bytes, DataType, NBytes, ReflectedType};
use crate::error::ChunkError;
use crate::tiling::SampleTiles;
use crate::{variant_from_data, SampleShape};

/// A value presented to the chunk writer.
///
/// Closed sum over everything the serializer understands; the chunk copies
/// or references the payload into its own data block on admission.
#[derive(Debug, Clone)]
pub enum SampleValue {
    /// Pre-serialized bytes. Shape is unknown to the serializer.
    Bytes(Vec<u8>),
    Numeric(NumericArray),
    Scalar(ScalarValue),
    Text(String),
    Json(serde_json::Value),
    List(Vec<serde_json::Value>),
    /// An already-encoded image blob with a known decoded shape.
    Prepared(PreparedSample),
    /// Continuation handle for a sample split across chunks.
    Tiles(SampleTiles),
}

impl SampleValue {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::Numeric(_) => "numeric array",
            Self::Scalar(_) => "scalar",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
            Self::List(_) => "list",
            Self::Prepared(_) => "prepared sample",
            Self::Tiles(_) => "sample tiles",
        }
    }

    pub fn from_array<T: ReflectedType>(array: &ArrayD<T>) -> Self {
        Self::Numeric(NumericArray::from_array(array))
    }
}

variant_from_data!(SampleValue, Numeric, NumericArray);
variant_from_data!(SampleValue, Scalar, ScalarValue);
variant_from_data!(SampleValue, Text, String);
variant_from_data!(SampleValue, Prepared, PreparedSample);
variant_from_data!(SampleValue, Tiles, SampleTiles);

impl From<&str> for SampleValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

variant_from_data!(ScalarValue, Int, i64);
variant_from_data!(ScalarValue, Float, f64);
variant_from_data!(ScalarValue, Bool, bool);

/// A dtype-erased numeric array: C-order little-endian bytes plus shape.
#[derive(Debug, Clone)]
pub struct NumericArray {
    dtype: DataType,
    shape: SampleShape,
    bytes: Vec<u8>,
}

impl NumericArray {
    pub fn from_array<T: ReflectedType>(array: &ArrayD<T>) -> Self {
        let mut bytes = Vec::with_capacity(array.len() * T::DTYPE.nbytes());
        // logical (row-major) order regardless of the array's layout
        for v in array.iter() {
            v.write_le(&mut bytes);
        }
        Self {
            dtype: T::DTYPE,
            shape: array.shape().iter().map(|d| *d as u64).collect(),
            bytes,
        }
    }

    pub(crate) fn from_raw(dtype: DataType, shape: SampleShape, bytes: Vec<u8>) -> Self {
        Self {
            dtype,
            shape,
            bytes,
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &SampleShape {
        &self.shape
    }

    pub fn nbytes(&self) -> usize {
        self.bytes.len()
    }

    /// Element bytes converted to the target dtype.
    pub(crate) fn cast(&self, to: DataType) -> Result<Cow<'_, [u8]>, ChunkError> {
        if self.dtype == to {
            Ok(Cow::Borrowed(&self.bytes))
        } else {
            cast_bytes(&self.bytes, self.dtype, to).map(Cow::Owned)
        }
    }
}

impl ScalarValue {
    /// One-element array form; shape normalizes to `(1,)` downstream.
    pub(crate) fn to_numeric(self) -> NumericArray {
        let mut bytes = Vec::new();
        let dtype = match self {
            Self::Int(v) => {
                v.write_le(&mut bytes);
                i64::DTYPE
            }
            Self::Float(v) => {
                v.write_le(&mut bytes);
                f64::DTYPE
            }
            Self::Bool(v) => {
                v.write_le(&mut bytes);
                bool::DTYPE
            }
        };
        NumericArray::from_raw(dtype, SampleShape::default(), bytes)
    }
}

/// An image blob that was encoded elsewhere, with its decoded geometry
/// already known.
#[derive(Debug, Clone)]
pub struct PreparedSample {
    encoded: Vec<u8>,
    compression: Compression,
    shape: SampleShape,
    dtype: DataType,
}

impl PreparedSample {
    /// Wraps an encoded image blob, decoding its header to learn the shape.
    pub fn from_encoded(encoded: Vec<u8>, compression: Compression) -> Result<Self, ChunkError> {
        let decoded = decode_image(compression, &encoded)?;
        Ok(Self {
            encoded,
            compression,
            shape: decoded.shape,
            dtype: decoded.dtype,
        })
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn shape(&self) -> &SampleShape {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn encoded_bytes(&self) -> &[u8] {
        &self.encoded
    }

    pub(crate) fn into_encoded(self) -> Vec<u8> {
        self.encoded
    }

    /// Raw row-major pixel bytes.
    pub(crate) fn decoded_bytes(&self) -> Result<Vec<u8>, ChunkError> {
        Ok(decode_image(self.compression, &self.encoded)?.bytes)
    }
}

/// One sample read back from a chunk.
///
/// `bytes` borrows from the chunk's data block when the read was performed
/// with `copy == false` and no decompression was needed; such a view must be
/// dropped before the next mutating call on the chunk.
#[derive(Debug)]
pub struct SampleView<'a> {
    pub dtype: DataType,
    pub shape: SampleShape,
    pub bytes: Cow<'a, [u8]>,
}

impl<'a> SampleView<'a> {
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes.into_owned()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Reassembles the sample as a typed array.
    ///
    /// With `cast == false` the target type must match the stored dtype
    /// exactly; with `cast == true` the stored elements are converted, under
    /// the same lossiness rules as writes.
    pub fn into_array<T: ReflectedType>(self, cast: bool) -> Result<ArrayD<T>, ChunkError> {
        let bytes = if T::DTYPE == self.dtype {
            self.bytes
        } else if cast {
            Cow::Owned(cast_bytes(&self.bytes, self.dtype, T::DTYPE)?)
        } else {
            return Err(ChunkError::DTypeCast {
                from: self.dtype,
                to: T::DTYPE,
            });
        };
        let item = T::DTYPE.nbytes();
        let elems: Vec<T> = bytes.chunks(item).map(T::read_le).collect();
        let dims: Vec<usize> = self.shape.iter().map(|d| *d as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&dims), elems).map_err(|_| ChunkError::InvalidSampleShape {
            expected_ndim: dims.len(),
            shape: self.shape.clone(),
        })
    }

    pub fn to_text(&self) -> Result<String, ChunkError> {
        String::from_utf8(self.bytes.to_vec())
            .map_err(|_| ChunkError::InvalidSampleType("non-utf8 text sample"))
    }

    pub fn to_json(&self) -> Result<serde_json::Value, ChunkError> {
        serde_json::from_slice(&self.bytes)
            .map_err(|_| ChunkError::InvalidSampleType("malformed json sample"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_array_preserves_logical_order() {
        let arr = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1u8, 2, 3, 4, 5, 6]).unwrap();
        let num = NumericArray::from_array(&arr);
        assert_eq!(num.shape().as_slice(), &[2, 3]);
        assert_eq!(num.nbytes(), 6);

        let transposed = arr.t().to_owned().into_dyn();
        let num_t = NumericArray::from_array(&transposed);
        assert_eq!(num_t.shape().as_slice(), &[3, 2]);
        // logical iteration order, not memory order
        assert_eq!(
            num_t
                .cast(DataType::UInt(crate::dtype::IntSize::b8))
                .unwrap()
                .as_ref(),
            &[1u8, 4, 2, 5, 3, 6][..]
        );
    }

    #[test]
    fn view_into_array_roundtrip() {
        let arr =
            ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.5f32, -2.0, 3.25, 0.0]).unwrap();
        let num = NumericArray::from_array(&arr);
        let view = SampleView {
            dtype: num.dtype(),
            shape: num.shape().clone(),
            bytes: Cow::Owned(num.cast(num.dtype()).unwrap().into_owned()),
        };
        let back: ArrayD<f32> = view.into_array(false).unwrap();
        assert_eq!(back, arr);
    }

    #[test]
    fn view_refuses_uncast_mismatch() {
        let view = SampleView {
            dtype: DataType::UInt(crate::dtype::IntSize::b8),
            shape: smallvec::smallvec![2],
            bytes: Cow::Owned(vec![1, 2]),
        };
        assert!(view.into_array::<f64>(false).is_err());
    }
}
