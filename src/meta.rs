use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::compression::Compression;
use crate::dtype::{DataType, Htype};
use crate::error::ChunkError;
use crate::{MaybeNdim, SampleShape};

/// Shared handle to a tensor's descriptor.
///
/// The chunk only mutates it through [TensorMeta::update_shape_interval] and
/// the length counter; callers serialize access.
pub type TensorMetaRef = Arc<RwLock<TensorMeta>>;

/// Descriptor of one tensor: element type, semantic type, codecs and the
/// envelope of sample shapes seen so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorMeta {
    pub dtype: DataType,
    #[serde(default)]
    pub htype: Htype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_compression: Option<Compression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_compression: Option<Compression>,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub min_shape: SampleShape,
    #[serde(default)]
    pub max_shape: SampleShape,
}

impl TensorMeta {
    pub fn new(dtype: DataType, htype: Htype) -> Self {
        Self {
            dtype,
            htype,
            sample_compression: None,
            chunk_compression: None,
            length: 0,
            min_shape: SampleShape::default(),
            max_shape: SampleShape::default(),
        }
    }

    pub fn with_sample_compression(mut self, codec: Compression) -> Self {
        self.sample_compression = Some(codec);
        self
    }

    pub fn with_chunk_compression(mut self, codec: Compression) -> Self {
        self.chunk_compression = Some(codec);
        self
    }

    pub fn into_ref(self) -> TensorMetaRef {
        Arc::new(RwLock::new(self))
    }

    /// Widens the min/max shape envelope to cover `shape`.
    ///
    /// The first registered sample fixes the tensor's dimensionality; any
    /// later mismatch is an [ChunkError::InvalidSampleShape].
    pub fn update_shape_interval(&mut self, shape: &SampleShape) -> Result<(), ChunkError> {
        if self.max_shape.is_empty() {
            self.min_shape = shape.clone();
            self.max_shape = shape.clone();
            return Ok(());
        }
        if shape.len() != self.max_shape.len() {
            return Err(ChunkError::InvalidSampleShape {
                expected_ndim: self.max_shape.len(),
                shape: shape.clone(),
            });
        }
        for (i, &dim) in shape.iter().enumerate() {
            self.min_shape[i] = self.min_shape[i].min(dim);
            self.max_shape[i] = self.max_shape[i].max(dim);
        }
        Ok(())
    }
}

impl MaybeNdim for TensorMeta {
    fn maybe_ndim(&self) -> Option<usize> {
        if self.max_shape.is_empty() {
            None
        } else {
            Some(self.max_shape.len())
        }
    }
}
