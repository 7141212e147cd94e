use thiserror::Error;

use crate::compression::Compression;
use crate::dtype::DataType;
use crate::SampleShape;

/// Errors raised by the chunk subsystem.
///
/// Shape, type and cast errors are raised before any state is touched, so a
/// failed call leaves the chunk exactly as it was. A refused admission is
/// not an error; see [crate::chunk::Extend].
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("sample has shape {shape:?} but the tensor has dimensionality {expected_ndim}")]
    InvalidSampleShape {
        expected_ndim: usize,
        shape: SampleShape,
    },

    #[error("cannot serialize sample of type {0}")]
    InvalidSampleType(&'static str),

    #[error("refusing lossy cast from {from} to {to}")]
    DTypeCast { from: DataType, to: DataType },

    #[error("{codec} codec failed: {reason}")]
    Compression {
        codec: Compression,
        reason: String,
    },

    #[error("malformed chunk buffer at offset {offset} (version {version:?}): {reason}")]
    ChunkFormat {
        version: String,
        offset: usize,
        reason: String,
    },

    #[error("sample of {nbytes} bytes exceeds the chunk budget of {max} and cannot be tiled")]
    BudgetExceeded { nbytes: usize, max: usize },

    #[error("no sample at local index {0}")]
    SampleIndexOutOfRange(usize),
}

impl ChunkError {
    pub(crate) fn format(version: &str, offset: usize, reason: impl Into<String>) -> Self {
        Self::ChunkFormat {
            version: version.to_owned(),
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn codec(codec: Compression, reason: impl Into<String>) -> Self {
        Self::Compression {
            codec,
            reason: reason.into(),
        }
    }
}
