use alloc::sync::Arc;
use core::fmt;

/// A file a page can be lazily loaded from.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number of bytes
    /// read, which is short at end of file.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

    /// File length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a file-backed page's contents come from: `length` bytes of `file` at
/// `offset`, the rest of the page zero.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn BackingFile>,
    pub offset: usize,
    pub length: usize,
}

impl FileBacking {
    pub fn new(file: Arc<dyn BackingFile>, offset: usize, length: usize) -> Self {
        Self {
            file,
            offset,
            length,
        }
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
