//! Memory-block and pool types (external collaborator, minimal substrate).
//!
//! The real memory-block pool (shared-memory segment allocation, refcounted
//! arenas) is out of scope; this crate only needs enough of it to decide shm
//! eligibility (§3 `do_shm`) and to carry payload bytes through the queue.

use std::rc::Rc;

/// A refcounted block of audio sample data.
///
/// `Rc<[u8]>` gives us the refcounting the teacher's `pa_memblock` provides
/// without reimplementing a custom allocator; a zero-length block represents
/// a "hole" per §4.4.
#[derive(Debug, Clone)]
pub struct Memblock {
    data: Rc<[u8]>,
}

impl Memblock {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    pub fn hole() -> Self {
        Self { data: Rc::from(Vec::new().into_boxed_slice()) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// The seam the context's shm-eligibility check (§3 `do_shm`) dispatches
/// against. A pool backed by real shared memory would report `true`.
pub trait MemblockPool {
    fn supports_shared_memory(&self) -> bool;
    fn max_block_size(&self) -> usize;
}

/// A pool with no shared-memory backing; always eligible to allocate, never
/// eligible for the shm fast path.
pub struct HeapPool {
    max_block_size: usize,
}

impl HeapPool {
    pub fn new(max_block_size: usize) -> Self {
        Self { max_block_size }
    }
}

impl Default for HeapPool {
    fn default() -> Self {
        // 64 KiB, the teacher's documented default tile size ballpark.
        Self::new(65536)
    }
}

impl MemblockPool for HeapPool {
    fn supports_shared_memory(&self) -> bool {
        false
    }

    fn max_block_size(&self) -> usize {
        self.max_block_size
    }
}

/// A pool that reports shared-memory support, for exercising the `do_shm`
/// negotiation path in tests without a real shm implementation.
pub struct ShmCapablePool {
    max_block_size: usize,
}

impl ShmCapablePool {
    pub fn new(max_block_size: usize) -> Self {
        Self { max_block_size }
    }
}

impl MemblockPool for ShmCapablePool {
    fn supports_shared_memory(&self) -> bool {
        true
    }

    fn max_block_size(&self) -> usize {
        self.max_block_size
    }
}
