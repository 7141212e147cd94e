//! Interface the object-store collaborator exposes to the core.
//!
//! The engine itself never performs I/O; it emits and consumes opaque chunk
//! buffers keyed by path. Production backends (S3, local filesystem) live
//! outside this crate; [MemoryStore] is the in-crate double.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::RwLock;

use bytes::Bytes;
use itertools::Itertools;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Get,
    Set,
    Delete,
    List,
}

impl Display for StorageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::List => "list",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage {kind} failed: {cause}")]
    Op {
        kind: StorageErrorKind,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Key/value map of string path to opaque bytes.
pub trait ObjectStore: Send + Sync {
    fn get(&self, path: &str) -> Result<Bytes, StorageError>;

    fn set(&self, path: &str, value: Bytes) -> Result<(), StorageError>;

    fn delete(&self, path: &str) -> Result<(), StorageError>;

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    fn has(&self, path: &str) -> Result<bool, StorageError> {
        match self.get(path) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// In-memory store backed by a hash map, for tests and scratch datasets.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let map = self.map.read().expect("store lock poisoned");
        map.get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_owned()))
    }

    fn set(&self, path: &str, value: Bytes) -> Result<(), StorageError> {
        let mut map = self.map.write().expect("store lock poisoned");
        map.insert(path.to_owned(), value);
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let mut map = self.map.write().expect("store lock poisoned");
        map.remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_owned()))
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let map = self.map.read().expect("store lock poisoned");
        Ok(map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .sorted_unstable()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, ChunkConfig, ChunkVariant};
    use crate::dtype::{DataType, Htype, IntSize};
    use crate::meta::TensorMeta;
    use crate::sample::SampleValue;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn basic_operations() {
        let store = MemoryStore::new();
        store.set("chunks/c0", Bytes::from_static(b"abc")).unwrap();
        store.set("chunks/c1", Bytes::from_static(b"def")).unwrap();
        store.set("meta/tensor.json", Bytes::from_static(b"{}")).unwrap();

        assert_eq!(&store.get("chunks/c0").unwrap()[..], b"abc");
        assert!(matches!(
            store.get("chunks/zzz"),
            Err(StorageError::NotFound(_))
        ));
        assert!(store.has("chunks/c1").unwrap());

        assert_eq!(
            store.list_prefix("chunks/").unwrap(),
            vec!["chunks/c0".to_owned(), "chunks/c1".to_owned()]
        );

        store.delete("chunks/c0").unwrap();
        assert!(!store.has("chunks/c0").unwrap());
        assert!(matches!(
            store.delete("chunks/c0"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn chunk_roundtrip_through_store() {
        let store = MemoryStore::new();
        let meta = TensorMeta::new(DataType::UInt(IntSize::b8), Htype::Generic).into_ref();
        let mut chunk = ChunkVariant::new(ChunkConfig::default(), meta.clone());
        let arr = ArrayD::from_elem(IxDyn(&[3, 3]), 8u8);
        chunk
            .extend_if_has_space(SampleValue::from_array(&arr))
            .unwrap();

        store
            .set("chunks/c0", Bytes::from(chunk.tobytes().unwrap()))
            .unwrap();

        let buf = store.get("chunks/c0").unwrap();
        let back = ChunkVariant::frombuffer(buf, false, ChunkConfig::default(), meta).unwrap();
        let view = back.read_sample(0, false).unwrap();
        assert_eq!(view.shape.as_slice(), &[3, 3]);
        assert_eq!(view.as_bytes(), &[8u8; 9][..]);
    }
}
