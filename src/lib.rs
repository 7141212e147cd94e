use smallvec::SmallVec;

pub mod chunk;
pub mod compression;
pub mod dtype;
pub mod encode;
pub mod error;
pub mod meta;
pub mod sample;
pub mod serialize;
pub mod store;
pub mod tiling;
mod util;

const SHAPE_SMALLVEC_SIZE: usize = 6;

/// Format version embedded in every serialized chunk.
pub const CHUNK_FORMAT_VERSION: &str = "1.1";

pub type CoordVec<T> = SmallVec<[T; SHAPE_SMALLVEC_SIZE]>;
/// Shape of a single sample. Axis lengths are `u64` in memory; the wire
/// tables store them as `u32`.
pub type SampleShape = CoordVec<u64>;

pub use chunk::{Chunk, ChunkConfig, ChunkVariant, Extend};
pub use compression::Compression;
pub use dtype::{DataType, Htype, ReflectedType};
pub use error::ChunkError;
pub use meta::{TensorMeta, TensorMetaRef};
pub use sample::{SampleValue, SampleView};

pub trait Ndim {
    fn ndim(&self) -> usize;

    fn same_ndim<T: Ndim>(&self, other: &T) -> Result<usize, &'static str> {
        let n = self.ndim();
        if n == other.ndim() {
            Ok(n)
        } else {
            Err("Inconsistent dimensionalities")
        }
    }
}

pub trait MaybeNdim {
    fn maybe_ndim(&self) -> Option<usize>;
}

impl<T: Ndim> MaybeNdim for T {
    fn maybe_ndim(&self) -> Option<usize> {
        Some(self.ndim())
    }
}

impl Ndim for SampleShape {
    fn ndim(&self) -> usize {
        self.len()
    }
}
