//! Batch marshalling for device kernels
//!
//! A batched kernel call takes per-device arrays of tile base pointers,
//! strides, and extents, split into groups of identical shape. Groups
//! are keyed by the `(mb, nb, ld)` tuple of every operand plus whether
//! the tile sits on the matrix diagonal (kernels treat diagonal tiles
//! differently); interior/edge tile combinations bound the group count
//! at eight per call.
//!
//! The marshaller keeps the coherence guards of every pushed tile alive
//! until dispatch completes, stages the pointer arrays to the device in
//! one copy, launches one kernel per non-empty group, and synchronises
//! the compute queue before returning to the scheduler.

use crate::coherence::TileGuard;
use crate::device::DeviceRegistry;
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::tile::Tile;
use smallvec::SmallVec;

/// Upper bound on shape groups per batched call
pub const MAX_BATCH_GROUPS: usize = 8;

/// Maximum operand slots per batched call (e.g. gemm uses A, B, C)
pub const MAX_BATCH_OPS: usize = 3;

/// Shape signature of one group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupKey {
    /// Per-operand `(mb, nb, stride)`
    pub dims: SmallVec<[(i64, i64, i64); MAX_BATCH_OPS]>,
    /// True when the tiles sit on the matrix diagonal
    pub diagonal: bool,
}

/// One shape group: parallel pointer arrays per operand slot
pub struct BatchGroup<T> {
    /// Shape signature shared by every entry
    pub key: GroupKey,
    /// Pointer arrays, one per operand slot
    pub ptrs: SmallVec<[Vec<*mut T>; MAX_BATCH_OPS]>,
}

impl<T> BatchGroup<T> {
    /// Number of tile sets in the group
    pub fn len(&self) -> usize {
        self.ptrs.first().map(Vec::len).unwrap_or(0)
    }

    /// True when no tile sets were pushed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Marshaller for one `(device, queue)` slot
pub struct DeviceBatch<T: Scalar> {
    device: u32,
    queue: usize,
    groups: Vec<BatchGroup<T>>,
    guards: Vec<TileGuard<T>>,
}

impl<T: Scalar> DeviceBatch<T> {
    /// Start a batch for one device and compute queue
    pub fn new(device: u32, queue: usize) -> Self {
        Self {
            device,
            queue,
            groups: Vec::new(),
            guards: Vec::new(),
        }
    }

    /// Device index this batch targets
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Append one tile set (one kernel instance) to the matching group;
    /// returns the group's index.
    ///
    /// `guards` are the coherence acquisitions backing `tiles`; they
    /// stay alive until [`dispatch`](Self::dispatch).
    pub fn push(
        &mut self,
        tiles: &[Tile<T>],
        diagonal: bool,
        guards: impl IntoIterator<Item = TileGuard<T>>,
    ) -> Result<usize> {
        assert!(tiles.len() <= MAX_BATCH_OPS);
        let key = GroupKey {
            dims: tiles.iter().map(|t| (t.mb(), t.nb(), t.stride())).collect(),
            diagonal,
        };

        let at = match self.groups.iter_mut().position(|g| g.key == key) {
            Some(at) => at,
            None => {
                if self.groups.len() == MAX_BATCH_GROUPS {
                    return Err(Error::invariant(format!(
                        "batched call needs more than {} shape groups",
                        MAX_BATCH_GROUPS
                    )));
                }
                self.groups.push(BatchGroup {
                    key,
                    ptrs: tiles.iter().map(|_| Vec::new()).collect(),
                });
                self.groups.len() - 1
            }
        };
        for (slot, tile) in tiles.iter().enumerate() {
            self.groups[at].ptrs[slot].push(tile.data());
        }
        self.guards.extend(guards);
        Ok(at)
    }

    /// Shape groups collected so far
    pub fn groups(&self) -> &[BatchGroup<T>] {
        &self.groups
    }

    /// Stage pointer arrays, launch one kernel per non-empty group
    /// (passing the group's index), and sync the compute queue. Guards
    /// are released on return.
    pub fn dispatch<F>(self, registry: &DeviceRegistry, mut launch: F) -> Result<()>
    where
        F: FnMut(usize, &BatchGroup<T>) -> Result<()>,
    {
        // one host-to-device copy for all pointer arrays
        let total: usize = self
            .groups
            .iter()
            .flat_map(|g| g.ptrs.iter().map(Vec::len))
            .sum();
        if total > 0 && (self.device as usize) < registry.num_devices() {
            let host_array: Vec<u64> = self
                .groups
                .iter()
                .flat_map(|g| g.ptrs.iter().flatten().map(|p| *p as u64))
                .collect();
            let mut staged = vec![0u64; host_array.len()];
            registry.device(self.device).copy_to_device(
                host_array.as_ptr().cast(),
                staged.as_mut_ptr().cast(),
                host_array.len() * std::mem::size_of::<u64>(),
                registry.queue_slot(self.queue),
            );
        }

        for (at, group) in self.groups.iter().enumerate() {
            if !group.is_empty() {
                launch(at, group)?;
            }
        }
        if (self.device as usize) < registry.num_devices() {
            registry.sync(self.device, self.queue);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TileCatalog;
    use crate::coherence::{Access, Coherence};
    use crate::memory::TilePool;
    use crate::tile::{Layout, MemLoc};
    use std::sync::Arc;

    fn coherence_with_tiles(n: i64) -> Coherence<f64> {
        let coh = Coherence::new(Arc::new(TileCatalog::new()), Arc::new(TilePool::new()));
        for i in 0..n {
            coh.catalog().node_or_insert(i, 0, 4, 4);
        }
        coh
    }

    #[test]
    fn test_grouping_by_shape_and_diagonal() {
        let coh = coherence_with_tiles(6);
        let mut batch = DeviceBatch::new(0, 0);

        for i in 0..6 {
            let g = coh
                .acquire(i, 0, MemLoc::Device(0), Access::Write, Layout::ColMajor)
                .unwrap();
            let t = g.tile();
            batch.push(&[t], i == 0, [g]).unwrap();
        }

        // one diagonal group, one off-diagonal group
        assert_eq!(batch.groups().len(), 2);
        let diag: Vec<usize> = batch.groups().iter().map(BatchGroup::len).collect();
        assert!(diag.contains(&1) && diag.contains(&5));
    }

    #[test]
    fn test_dispatch_launches_and_syncs() {
        let registry = DeviceRegistry::staged(1);
        let coh = coherence_with_tiles(3);
        let mut batch = DeviceBatch::new(0, 2);

        for i in 0..3 {
            let g = coh
                .acquire(i, 0, MemLoc::Device(0), Access::Write, Layout::ColMajor)
                .unwrap();
            let t = g.tile();
            batch.push(&[t], false, [g]).unwrap();
        }

        let mut launched = 0;
        batch
            .dispatch(&registry, |_, group| {
                launched += group.len();
                Ok(())
            })
            .unwrap();
        assert_eq!(launched, 3);
    }

    #[test]
    fn test_group_overflow_is_an_error() {
        let coh = coherence_with_tiles(1);
        let mut batch = DeviceBatch::new(0, 0);

        // 9 distinct shapes cannot fit in 8 groups
        for k in 0..9i64 {
            coh.catalog().node_or_insert(100 + k, 0, 4 + k, 4);
            let g = coh
                .acquire(100 + k, 0, MemLoc::Device(0), Access::Write, Layout::ColMajor)
                .unwrap();
            let t = g.tile();
            let res = batch.push(&[t], false, [g]);
            if k < 8 {
                res.unwrap();
            } else {
                assert!(res.is_err());
            }
        }
    }
}
