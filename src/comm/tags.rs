//! Centralised tag allocation
//!
//! Wire tags are 32-bit values `(operation_salt << 16) | subtag`. Every
//! operation reserves its range from the matrix's [`TagPool`] before the
//! first message; reservations assert non-collision with concurrently
//! live ranges, so two collectives on overlapping rank sets can never
//! match each other's messages.

use parking_lot::Mutex;
use std::sync::Arc;

/// Operation salts for the crate's built-in collectives and drivers
pub mod salt {
    /// Broadcast trees
    pub const BCAST: u16 = 0x01;
    /// Reduction trees
    pub const REDUCE: u16 = 0x02;
    /// Row permutations
    pub const PERMUTE: u16 = 0x03;
    /// Symmetric row/col permutations
    pub const PERMUTE_SYM: u16 = 0x04;
    /// Triangle-triangle factor/apply exchanges
    pub const TT: u16 = 0x05;
    /// Tagged gather/scatter
    pub const GATHER: u16 = 0x06;
    /// Triangular-solve broadcasts
    pub const TRSM: u16 = 0x07;
    /// Right-hand-side broadcasts of solve drivers
    pub const TRSM_B: u16 = 0x08;
    /// Triangle-triangle factor exchanges (ttqrt)
    pub const TTQRT: u16 = 0x09;
    /// Triangle-triangle apply exchanges (ttmqr)
    pub const TTMQR: u16 = 0x0A;
}

#[derive(Default)]
struct Live {
    ranges: Vec<(u32, u32)>, // [start, end)
}

/// Per-communicator tag allocator
#[derive(Clone, Default)]
pub struct TagPool {
    live: Arc<Mutex<Live>>,
}

impl TagPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `[base, base + len)` subtags under `salt`.
    ///
    /// Panics if the range is malformed or collides with a live range;
    /// a collision is always a driver bug.
    pub fn reserve(&self, salt: u16, base: u16, len: u32) -> TagRange {
        assert!(len > 0, "empty tag range");
        let start = (u32::from(salt) << 16) | u32::from(base);
        let end = start
            .checked_add(len)
            .filter(|e| *e <= (u32::from(salt) + 1) << 16)
            .unwrap_or_else(|| panic!("tag range overflows salt {:#x}", salt));

        let mut live = self.live.lock();
        for &(s, e) in &live.ranges {
            assert!(
                end <= s || e <= start,
                "tag range [{:#x}, {:#x}) collides with live [{:#x}, {:#x})",
                start,
                end,
                s,
                e
            );
        }
        live.ranges.push((start, end));
        TagRange {
            pool: self.clone(),
            start,
            len,
        }
    }
}

/// A reserved, exclusive range of wire tags
///
/// Freed back to the pool on drop.
pub struct TagRange {
    pool: TagPool,
    start: u32,
    len: u32,
}

impl TagRange {
    /// The tag at `offset` within the range
    #[inline]
    pub fn tag(&self, offset: u32) -> u32 {
        assert!(offset < self.len, "tag offset {} out of {}", offset, self.len);
        self.start + offset
    }

    /// Number of tags in the range
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Always false; ranges cannot be empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Drop for TagRange {
    fn drop(&mut self) {
        let mut live = self.pool.live.lock();
        let end = self.start + self.len;
        if let Some(at) = live.ranges.iter().position(|&(s, e)| s == self.start && e == end) {
            live.ranges.remove(at);
        }
    }
}
