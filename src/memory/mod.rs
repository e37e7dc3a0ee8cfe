//! Pooled tile allocator
//!
//! A process-wide arena of tile-sized slabs, keyed by memory location and
//! byte size class. Freed slabs are reused LIFO; there is no
//! defragmentation. Host slabs are 64-byte aligned (suits SIMD kernels and
//! stands in for pinned allocations when no accelerator backend is built).
//!
//! The pool is the one piece of process-wide state besides the trace
//! buffer; it has an explicit [`init`]/[`shutdown`] pair, with lazy
//! creation as a convenience for tests.

use crate::error::{Error, Result};
use crate::tile::MemLoc;
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout as AllocLayout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

const SLAB_ALIGN: usize = 64;

/// A slab checked out of the pool
///
/// Blocks are returned with [`TilePool::release`]; they do not release
/// themselves on drop, mirroring the explicit lifecycle of workspace
/// tiles.
#[derive(Debug)]
pub struct PoolBlock {
    ptr: NonNull<u8>,
    bytes: usize,
    loc: MemLoc,
}

unsafe impl Send for PoolBlock {}
unsafe impl Sync for PoolBlock {}

impl PoolBlock {
    /// Base pointer, cast to the element type
    #[inline]
    pub fn as_ptr<T>(&self) -> *mut T {
        self.ptr.as_ptr().cast()
    }

    /// Slab size in bytes
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Location this slab belongs to
    #[inline]
    pub fn loc(&self) -> MemLoc {
        self.loc
    }
}

struct RawSlab(NonNull<u8>);

unsafe impl Send for RawSlab {}

/// Per-location slab pool
pub struct TilePool {
    free: Mutex<HashMap<(MemLoc, usize), Vec<RawSlab>>>,
    outstanding: AtomicUsize,
    held_bytes: AtomicUsize,
}

impl Default for TilePool {
    fn default() -> Self {
        Self::new()
    }
}

impl TilePool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            free: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            held_bytes: AtomicUsize::new(0),
        }
    }

    fn raw_alloc(loc: MemLoc, bytes: usize) -> Result<NonNull<u8>> {
        debug_assert!(bytes > 0);
        let layout = AllocLayout::from_size_align(bytes, SLAB_ALIGN)
            .map_err(|_| Error::invariant(format!("bad slab layout: {} bytes", bytes)))?;
        // Device slabs are host-staged in this build; a real accelerator
        // backend allocates behind the DeviceOps seam instead.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(Error::OutOfMemory {
            size: bytes,
            location: loc.to_string(),
        })
    }

    fn raw_dealloc(ptr: NonNull<u8>, bytes: usize) {
        let layout = AllocLayout::from_size_align(bytes, SLAB_ALIGN).expect("bad slab layout");
        unsafe { dealloc(ptr.as_ptr(), layout) }
    }

    /// Check a slab of at least `bytes` out of the pool.
    ///
    /// Reuses a freed slab of the same class when available, else grows.
    /// Inside a [`reserve`](Self::reserve) window of matching class this
    /// never allocates and cannot fail.
    pub fn acquire(&self, loc: MemLoc, bytes: usize) -> Result<PoolBlock> {
        let reused = self.free.lock().get_mut(&(loc, bytes)).and_then(Vec::pop);
        let ptr = match reused {
            Some(slab) => {
                self.held_bytes.fetch_sub(bytes, Ordering::Relaxed);
                // reused slabs may hold stale contents
                unsafe { std::ptr::write_bytes(slab.0.as_ptr(), 0, bytes) };
                slab.0
            }
            None => {
                log::trace!("pool grow: {} bytes on {}", bytes, loc);
                Self::raw_alloc(loc, bytes)?
            }
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(PoolBlock { ptr, bytes, loc })
    }

    /// Return a slab to the pool (LIFO)
    pub fn release(&self, block: PoolBlock) {
        let prev = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "pool release without matching acquire");
        self.held_bytes.fetch_add(block.bytes, Ordering::Relaxed);
        self.free
            .lock()
            .entry((block.loc, block.bytes))
            .or_default()
            .push(RawSlab(block.ptr));
    }

    /// Pre-allocate `n_slabs` slabs of `slab_bytes` for `loc`, so
    /// subsequent workspace acquires of that class cannot fail.
    pub fn reserve(&self, loc: MemLoc, n_slabs: usize, slab_bytes: usize) -> Result<()> {
        let mut fresh = Vec::with_capacity(n_slabs);
        for _ in 0..n_slabs {
            fresh.push(RawSlab(Self::raw_alloc(loc, slab_bytes)?));
        }
        self.held_bytes
            .fetch_add(n_slabs * slab_bytes, Ordering::Relaxed);
        self.free
            .lock()
            .entry((loc, slab_bytes))
            .or_default()
            .append(&mut fresh);
        Ok(())
    }

    /// Return all free slabs for `loc` to the backing allocator
    pub fn shrink(&self, loc: MemLoc) {
        let mut free = self.free.lock();
        let keys: Vec<_> = free.keys().filter(|(l, _)| *l == loc).copied().collect();
        for key in keys {
            if let Some(slabs) = free.remove(&key) {
                self.held_bytes
                    .fetch_sub(key.1 * slabs.len(), Ordering::Relaxed);
                for slab in slabs {
                    Self::raw_dealloc(slab.0, key.1);
                }
            }
        }
    }

    /// Return every free slab to the backing allocator
    pub fn shrink_all(&self) {
        let mut free = self.free.lock();
        for ((_, bytes), slabs) in free.drain() {
            self.held_bytes
                .fetch_sub(bytes * slabs.len(), Ordering::Relaxed);
            for slab in slabs {
                Self::raw_dealloc(slab.0, bytes);
            }
        }
    }

    /// Number of blocks currently checked out
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Bytes currently parked on free lists
    pub fn held_bytes(&self) -> usize {
        self.held_bytes.load(Ordering::Relaxed)
    }
}

static GLOBAL_POOL: OnceLock<Arc<TilePool>> = OnceLock::new();

/// Initialise the process-wide pool (idempotent)
pub fn init() {
    let _ = GLOBAL_POOL.set(Arc::new(TilePool::new()));
}

/// The process-wide pool, created on first use
pub fn global() -> Arc<TilePool> {
    GLOBAL_POOL.get_or_init(|| Arc::new(TilePool::new())).clone()
}

/// Release all pooled memory held by the process-wide pool.
///
/// Outstanding blocks are unaffected; this only empties the free lists.
pub fn shutdown() {
    if let Some(pool) = GLOBAL_POOL.get() {
        pool.shrink_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuse() {
        let pool = TilePool::new();
        let a = pool.acquire(MemLoc::Host, 1024).unwrap();
        let first = a.as_ptr::<u8>();
        pool.release(a);

        // LIFO: the same slab comes back
        let b = pool.acquire(MemLoc::Host, 1024).unwrap();
        assert_eq!(b.as_ptr::<u8>(), first);
        assert_eq!(pool.outstanding(), 1);
        pool.release(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_acquire_zeroes_reused_slab() {
        let pool = TilePool::new();
        let a = pool.acquire(MemLoc::Host, 64).unwrap();
        unsafe { *a.as_ptr::<u8>() = 0xAB };
        pool.release(a);

        let b = pool.acquire(MemLoc::Host, 64).unwrap();
        assert_eq!(unsafe { *b.as_ptr::<u8>() }, 0);
        pool.release(b);
    }

    #[test]
    fn test_reserve_and_shrink() {
        let pool = TilePool::new();
        pool.reserve(MemLoc::Device(0), 4, 256).unwrap();
        assert_eq!(pool.held_bytes(), 4 * 256);

        let a = pool.acquire(MemLoc::Device(0), 256).unwrap();
        assert_eq!(pool.held_bytes(), 3 * 256);
        pool.release(a);

        pool.shrink(MemLoc::Device(0));
        assert_eq!(pool.held_bytes(), 0);
    }

    #[test]
    fn test_size_classes_are_distinct() {
        let pool = TilePool::new();
        let a = pool.acquire(MemLoc::Host, 128).unwrap();
        pool.release(a);

        // different class, must not reuse the 128-byte slab
        let b = pool.acquire(MemLoc::Host, 256).unwrap();
        assert_eq!(b.bytes(), 256);
        pool.release(b);
    }
}
