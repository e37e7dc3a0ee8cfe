//! Shared per-matrix state behind every view
//!
//! One `MatrixStorage` exists per logical matrix: tile geometry,
//! ownership and device-affinity functions, the tile catalog with its
//! coherence engine, the transport endpoint, the tag pool, and the
//! device registry. Views of the matrix clone an `Arc` of it; they never
//! copy tiles.

use crate::coherence::Coherence;
use crate::comm::{TagPool, Transport};
use crate::device::DeviceRegistry;
use crate::dtype::Scalar;
use crate::memory::{self, TilePool};
use crate::tile::MemLoc;
use std::sync::Arc;

/// Ownership function: `(i, j) -> rank`
pub type OwnerFn = Arc<dyn Fn(i64, i64) -> usize + Send + Sync>;

/// Device-affinity function: `(i, j) -> device index`
pub type DeviceFn = Arc<dyn Fn(i64, i64) -> u32 + Send + Sync>;

/// Tile-extent function: `index -> extent`
pub type TileDimFn = Arc<dyn Fn(i64) -> i64 + Send + Sync>;

/// Shared storage-side state of one matrix
pub struct MatrixStorage<T: Scalar> {
    pub(crate) m: i64,
    pub(crate) n: i64,
    pub(crate) mt: i64,
    pub(crate) nt: i64,
    row_offsets: Vec<i64>,
    col_offsets: Vec<i64>,
    pub(crate) grid: (usize, usize),
    owner: OwnerFn,
    device_of: DeviceFn,
    pub(crate) coherence: Coherence<T>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) tags: TagPool,
    pub(crate) devices: Arc<DeviceRegistry>,
}

/// Accumulate clamped tile extents until `total` is covered.
///
/// `f(k)` proposes the extent of tile `k`; the final tile is clamped so
/// the extents sum exactly to `total`.
pub(crate) fn offsets_from_fn(total: i64, f: &dyn Fn(i64) -> i64) -> Vec<i64> {
    let mut offsets = vec![0];
    let mut at = 0;
    let mut k = 0;
    while at < total {
        let ext = f(k).min(total - at);
        assert!(ext > 0, "tile extent function returned {} at index {}", ext, k);
        at += ext;
        offsets.push(at);
        k += 1;
    }
    offsets
}

impl<T: Scalar> MatrixStorage<T> {
    /// Build storage for an `m x n` matrix with the given tile extents,
    /// ownership, and device affinity, communicating over `transport`.
    pub fn new(
        m: i64,
        n: i64,
        tile_mb: TileDimFn,
        tile_nb: TileDimFn,
        grid: (usize, usize),
        owner: OwnerFn,
        device_of: DeviceFn,
        transport: Arc<dyn Transport>,
        devices: Arc<DeviceRegistry>,
    ) -> Arc<Self> {
        let row_offsets = offsets_from_fn(m, tile_mb.as_ref());
        let col_offsets = offsets_from_fn(n, tile_nb.as_ref());
        let mt = row_offsets.len() as i64 - 1;
        let nt = col_offsets.len() as i64 - 1;
        let catalog = Arc::new(crate::catalog::TileCatalog::new());
        let pool: Arc<TilePool> = memory::global();
        Arc::new(Self {
            m,
            n,
            mt,
            nt,
            row_offsets,
            col_offsets,
            grid,
            owner,
            device_of,
            coherence: Coherence::new(catalog, pool),
            transport,
            tags: TagPool::new(),
            devices,
        })
    }

    /// Block-cyclic ownership over a `p x q` grid:
    /// `(i mod p) + (j mod q) * p`
    pub fn block_cyclic_owner(p: usize, q: usize) -> OwnerFn {
        Arc::new(move |i, j| (i as usize % p) + (j as usize % q) * p)
    }

    /// Round-robin device affinity by tile row
    pub fn row_device_affinity(num_devices: u32) -> DeviceFn {
        Arc::new(move |i, _j| {
            if num_devices == 0 {
                0
            } else {
                (i % i64::from(num_devices)) as u32
            }
        })
    }

    /// Rows of tile `i`
    #[inline]
    pub fn tile_mb(&self, i: i64) -> i64 {
        self.row_offsets[i as usize + 1] - self.row_offsets[i as usize]
    }

    /// Columns of tile `j`
    #[inline]
    pub fn tile_nb(&self, j: i64) -> i64 {
        self.col_offsets[j as usize + 1] - self.col_offsets[j as usize]
    }

    /// Global element row of tile row `i`
    #[inline]
    pub fn row_offset(&self, i: i64) -> i64 {
        self.row_offsets[i as usize]
    }

    /// Global element column of tile column `j`
    #[inline]
    pub fn col_offset(&self, j: i64) -> i64 {
        self.col_offsets[j as usize]
    }

    /// Owning rank of tile `(i, j)`
    #[inline]
    pub fn tile_rank(&self, i: i64, j: i64) -> usize {
        (self.owner)(i, j)
    }

    /// Device affinity of tile `(i, j)`
    #[inline]
    pub fn tile_device(&self, i: i64, j: i64) -> u32 {
        (self.device_of)(i, j)
    }

    /// True when tile `(i, j)` is owned by this rank
    #[inline]
    pub fn tile_is_local(&self, i: i64, j: i64) -> bool {
        self.tile_rank(i, j) == self.transport.rank()
    }

    /// Memory location implied by the `Devices` target for tile `(i, j)`
    pub fn tile_device_loc(&self, i: i64, j: i64) -> MemLoc {
        if self.devices.num_devices() == 0 {
            MemLoc::Host
        } else {
            MemLoc::Device(self.tile_device(i, j) % self.devices.num_devices() as u32)
        }
    }

    /// Ensure the catalog has a node for `(i, j)`
    pub fn ensure_node(&self, i: i64, j: i64) {
        self.coherence
            .catalog()
            .node_or_insert(i, j, self.tile_mb(i), self.tile_nb(j));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_clamp_last_tile() {
        let offs = offsets_from_fn(10, &|_| 4);
        assert_eq!(offs, vec![0, 4, 8, 10]);
    }

    #[test]
    fn test_offsets_non_uniform() {
        // alternating full/half tiles, the ex13 pattern
        let nb = 6;
        let offs = offsets_from_fn(21, &move |j| if j % 2 != 0 { nb / 2 } else { nb });
        assert_eq!(offs, vec![0, 6, 9, 15, 18, 21]);
        let total: i64 = offs.windows(2).map(|w| w[1] - w[0]).sum();
        assert_eq!(total, 21);
    }

    #[test]
    fn test_block_cyclic_owner() {
        let owner = MatrixStorage::<f64>::block_cyclic_owner(2, 2);
        assert_eq!(owner(0, 0), 0);
        assert_eq!(owner(1, 0), 1);
        assert_eq!(owner(0, 1), 2);
        assert_eq!(owner(1, 1), 3);
        assert_eq!(owner(2, 2), 0);
    }
}
