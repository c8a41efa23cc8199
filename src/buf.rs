use std::fmt;
use std::sync::Arc;

/// Allocator for [`ByteBuf`] instances
///
/// A cheap copyable handle, normally owned by the glue code and shared
/// by every component that needs to produce buffers.  Allocation
/// strategy is intentionally simple: each buffer gets its own backing
/// storage of the requested capacity, and growth beyond that is
/// handled by the buffer itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufAllocator;

impl BufAllocator {
    /// Allocate an empty buffer whose backing storage can hold at
    /// least `capacity` bytes before it needs to grow
    pub fn buffer(&self, capacity: usize) -> ByteBuf {
        ByteBuf {
            storage: Arc::new(Vec::with_capacity(capacity)),
            rpos: 0,
            wpos: 0,
        }
    }
}

/// Contiguous byte buffer with shared, copy-on-write backing storage
///
/// A `ByteBuf` is a reader index and a writer index over
/// reference-counted storage.  Cloning is cheap and shares the
/// storage; the first write through any handle that still shares its
/// storage duplicates it, so no handle can ever observe another
/// handle's mutation.  This is what allows one side to extract and
/// keep the accumulated bytes while the other side keeps writing.
///
/// Readable bytes are the region between the reader index and the
/// writer index.  Reading is destructive only in the sense that the
/// reader index advances; the bytes themselves stay addressable
/// through [`ByteBuf::bytes_at`] until the buffer is cleared.
#[derive(Clone)]
pub struct ByteBuf {
    storage: Arc<Vec<u8>>,
    rpos: usize,
    wpos: usize,
}

impl ByteBuf {
    /// Number of bytes available to read
    pub fn readable_bytes(&self) -> usize {
        self.wpos - self.rpos
    }

    /// Current reader index
    pub fn reader_index(&self) -> usize {
        self.rpos
    }

    /// Current writer index
    pub fn writer_index(&self) -> usize {
        self.wpos
    }

    /// Capacity of the backing storage in bytes
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// The readable bytes as a slice
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.rpos..self.wpos]
    }

    /// Address of the backing storage, for reference-equality checks.
    /// Two buffers share storage exactly when their addresses are
    /// equal.  Do not dereference.
    pub fn storage_ptr(&self) -> *const u8 {
        self.storage.as_ptr()
    }

    /// Append bytes at the writer index, duplicating the backing
    /// storage first if any other handle shares it.  Storage grows as
    /// required; a single oversized write is always honoured in full.
    pub fn write_bytes(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        let end = self.wpos + src.len();
        let storage = Arc::make_mut(&mut self.storage);
        if self.wpos == storage.len() {
            storage.extend_from_slice(src);
        } else {
            // Overwriting a region left behind by `clear`
            if storage.len() < end {
                storage.resize(end, 0);
            }
            storage[self.wpos..end].copy_from_slice(src);
        }
        self.wpos = end;
    }

    /// Append a string's bytes, without any terminator
    pub fn write_str(&mut self, src: &str) {
        self.write_bytes(src.as_bytes());
    }

    /// Advance the reader index over `count` already-read bytes
    ///
    /// Panics if `count` exceeds the readable byte count, which would
    /// indicate a bug in the calling code.
    pub fn advance_reader(&mut self, count: usize) {
        assert!(
            count <= self.readable_bytes(),
            "advanced reader past writer index"
        );
        self.rpos += count;
    }

    /// View `len` bytes at an absolute index, if that range has been
    /// written
    pub fn bytes_at(&self, index: usize, len: usize) -> Option<&[u8]> {
        let end = index.checked_add(len)?;
        if end > self.wpos {
            return None;
        }
        Some(&self.storage[index..end])
    }

    /// View `len` bytes at an absolute index as UTF-8, if that range
    /// has been written and is valid UTF-8
    pub fn str_at(&self, index: usize, len: usize) -> Option<&str> {
        std::str::from_utf8(self.bytes_at(index, len)?).ok()
    }

    /// Reset both indices to zero, keeping the backing storage (and
    /// any sharing of it) intact
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("readable", &self.readable_bytes())
            .field("reader_index", &self.rpos)
            .field("writer_index", &self.wpos)
            .field("capacity", &self.capacity())
            .finish()
    }
}
