//! Shared, read-only input bytes

use crate::ParseResult;
use memmap2::Mmap;
use std::fmt;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

/// Immutable byte buffer shared by every reader of a session
///
/// Either a read-only file mapping or an owned vector. Cloning is cheap.
#[derive(Clone)]
pub struct ByteBuffer(Arc<dyn AsRef<[u8]> + Send + Sync>);

impl ByteBuffer {
    /// Map a file read-only
    pub fn map_file(path: &Path) -> ParseResult<Self> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and the engine never writes through it.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self(Arc::new(map)))
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(Arc::new(data))
    }

    /// Bounds-checked sub-slice
    pub fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.get(offset..end)
    }
}

impl Deref for ByteBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        (*self.0).as_ref()
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer").field("len", &self.len()).finish()
    }
}
