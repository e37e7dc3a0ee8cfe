//! Tile catalog: every known instance of every tile
//!
//! Per matrix, the catalog maps `(i, j)` to an entry listing all
//! instances of that tile (host plus each device), each carrying a MOSI
//! coherence state and a lifetime flag (origin vs workspace). The map is
//! read-mostly and grows monotonically during an algorithm; each entry
//! has its own lock, held only for the duration of a state transition.

use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::memory::PoolBlock;
use crate::tile::{Layout, MemLoc, Tile};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// MOSI coherence state of one tile instance
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mosi {
    /// Contents are stale; the buffer may be reclaimed
    Invalid,
    /// Contents valid, identical to every other `Shared` instance
    Shared,
    /// `Shared`-equivalent for reads, pinned against eviction
    OnHold,
    /// The unique up-to-date copy
    Modified,
}

impl Mosi {
    /// True for states whose contents may be read
    #[inline]
    pub fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

/// Backing storage of one instance
pub(crate) enum InstanceBuf<T> {
    /// Points into user-owned storage (origin tiles)
    External(*mut T),
    /// A slab checked out of the tile pool (workspace and derived copies)
    Pooled(PoolBlock),
}

unsafe impl<T: Send> Send for InstanceBuf<T> {}

impl<T> InstanceBuf<T> {
    #[inline]
    pub(crate) fn ptr(&self) -> *mut T {
        match self {
            Self::External(p) => *p,
            Self::Pooled(b) => b.as_ptr(),
        }
    }
}

/// One physical copy of a tile at one location
pub struct TileInstance<T> {
    pub(crate) buf: InstanceBuf<T>,
    pub(crate) stride: i64,
    pub(crate) layout: Layout,
    pub(crate) state: Mosi,
    pub(crate) origin: bool,
    pub(crate) holds: u32,
}

impl<T: Scalar> TileInstance<T> {
    /// Coherence state
    pub fn state(&self) -> Mosi {
        self.state
    }

    /// True for the authoritative user-visible copy
    pub fn is_origin(&self) -> bool {
        self.origin
    }

    /// Physical element order of this instance
    pub fn layout(&self) -> Layout {
        self.layout
    }
}

/// All known instances of one `(i, j)` tile
pub struct TileEntry<T> {
    pub(crate) mb: i64,
    pub(crate) nb: i64,
    pub(crate) instances: SmallVec<[(MemLoc, TileInstance<T>); 2]>,
}

impl<T: Scalar> TileEntry<T> {
    /// Tile extent (rows)
    pub fn mb(&self) -> i64 {
        self.mb
    }

    /// Tile extent (columns)
    pub fn nb(&self) -> i64 {
        self.nb
    }

    /// Instance at `loc`, if any
    pub fn instance(&self, loc: MemLoc) -> Option<&TileInstance<T>> {
        self.instances.iter().find(|(l, _)| *l == loc).map(|(_, i)| i)
    }

    pub(crate) fn instance_mut(&mut self, loc: MemLoc) -> Option<&mut TileInstance<T>> {
        self.instances
            .iter_mut()
            .find(|(l, _)| *l == loc)
            .map(|(_, i)| i)
    }

    /// Location of the origin instance, if this rank holds one
    pub fn origin_loc(&self) -> Option<MemLoc> {
        self.instances
            .iter()
            .find(|(_, i)| i.origin)
            .map(|(l, _)| *l)
    }

    /// Locations of all instances
    pub fn locations(&self) -> impl Iterator<Item = MemLoc> + '_ {
        self.instances.iter().map(|(l, _)| *l)
    }

    /// Build a [`Tile`] view over the instance at `loc`
    pub fn tile(&self, loc: MemLoc) -> Option<Tile<T>> {
        self.instance(loc).map(|inst| {
            Tile::new(
                inst.buf.ptr(),
                self.mb,
                self.nb,
                inst.stride,
                inst.layout,
                loc,
                inst.origin,
            )
        })
    }

    /// Set the coherence state of the instance at `loc`.
    ///
    /// The caller holds this entry's lock by construction; transitions
    /// driven through the coherence engine are preferred.
    pub fn set_state(&mut self, loc: MemLoc, state: Mosi) {
        if let Some(inst) = self.instance_mut(loc) {
            inst.state = state;
        }
    }

    pub(crate) fn insert(&mut self, loc: MemLoc, inst: TileInstance<T>) {
        debug_assert!(self.instance(loc).is_none(), "duplicate instance at {}", loc);
        self.instances.push((loc, inst));
    }

    /// Remove and return the instance at `loc`.
    ///
    /// Legal only for non-origin instances that are not `Modified` and
    /// not referenced by an in-flight acquire.
    pub(crate) fn remove(&mut self, loc: MemLoc) -> Result<TileInstance<T>> {
        let idx = self
            .instances
            .iter()
            .position(|(l, _)| *l == loc)
            .ok_or_else(|| Error::invariant(format!("erase of absent instance at {}", loc)))?;
        let inst = &self.instances[idx].1;
        if inst.origin {
            return Err(Error::invariant("erase of origin instance"));
        }
        if inst.holds > 0 {
            return Err(Error::invariant("erase of referenced instance"));
        }
        if inst.state == Mosi::Modified {
            return Err(Error::invariant("erase of the only modified copy"));
        }
        Ok(self.instances.remove(idx).1)
    }

    /// Verify the per-tile coherence invariants.
    ///
    /// At most one `Modified`; if one exists, every other instance is
    /// `Invalid` or `OnHold`; otherwise all valid instances are
    /// bit-identical.
    pub fn check_invariants(&self) -> Result<()> {
        let modified: Vec<MemLoc> = self
            .instances
            .iter()
            .filter(|(_, i)| i.state == Mosi::Modified)
            .map(|(l, _)| *l)
            .collect();
        if modified.len() > 1 {
            return Err(Error::invariant(format!(
                "{} modified instances: {:?}",
                modified.len(),
                modified
            )));
        }
        if modified.len() == 1 {
            for (loc, inst) in &self.instances {
                if *loc != modified[0] && matches!(inst.state, Mosi::Shared) {
                    return Err(Error::invariant(format!(
                        "shared instance at {} alongside modified at {}",
                        loc, modified[0]
                    )));
                }
            }
            return Ok(());
        }

        // No modified copy: every valid instance must agree bit-for-bit.
        let valid: Vec<&(MemLoc, TileInstance<T>)> = self
            .instances
            .iter()
            .filter(|(_, i)| i.state.is_valid())
            .collect();
        if let Some((first_loc, _)) = valid.first() {
            let a = self.tile(*first_loc).unwrap();
            for (loc, _) in valid.iter().skip(1) {
                let b = self.tile(*loc).unwrap();
                for j in 0..self.nb {
                    for i in 0..self.mb {
                        if a.get(i, j) != b.get(i, j) {
                            return Err(Error::invariant(format!(
                                "shared copies diverge at ({}, {}): {} vs {}",
                                i, j, *first_loc, loc
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// One catalog slot, lockable independently of the map
pub struct TileNode<T> {
    pub(crate) entry: Mutex<TileEntry<T>>,
}

/// Concurrent `(i, j) -> TileEntry` map
pub struct TileCatalog<T> {
    map: RwLock<HashMap<(i64, i64), Arc<TileNode<T>>>>,
}

impl<T: Scalar> Default for TileCatalog<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar> TileCatalog<T> {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Node for `(i, j)`, if present
    pub fn node(&self, i: i64, j: i64) -> Option<Arc<TileNode<T>>> {
        self.map.read().get(&(i, j)).cloned()
    }

    /// Node for `(i, j)`, created empty (with the given extents) if absent
    pub fn node_or_insert(&self, i: i64, j: i64, mb: i64, nb: i64) -> Arc<TileNode<T>> {
        if let Some(node) = self.node(i, j) {
            return node;
        }
        let mut map = self.map.write();
        map.entry((i, j))
            .or_insert_with(|| {
                Arc::new(TileNode {
                    entry: Mutex::new(TileEntry {
                        mb,
                        nb,
                        instances: SmallVec::new(),
                    }),
                })
            })
            .clone()
    }

    /// Install an origin instance at `loc` in state `Shared`.
    pub fn insert_origin(
        &self,
        i: i64,
        j: i64,
        mb: i64,
        nb: i64,
        buf: *mut T,
        stride: i64,
        layout: Layout,
        loc: MemLoc,
    ) {
        let node = self.node_or_insert(i, j, mb, nb);
        let mut entry = node.entry.lock();
        entry.insert(
            loc,
            TileInstance {
                buf: InstanceBuf::External(buf),
                stride,
                layout,
                state: Mosi::Shared,
                origin: true,
                holds: 0,
            },
        );
    }

    /// Install a pool-backed origin instance (for `insert_local_tiles`)
    pub fn insert_origin_pooled(
        &self,
        i: i64,
        j: i64,
        mb: i64,
        nb: i64,
        block: PoolBlock,
        stride: i64,
        layout: Layout,
        loc: MemLoc,
    ) {
        let node = self.node_or_insert(i, j, mb, nb);
        let mut entry = node.entry.lock();
        entry.insert(
            loc,
            TileInstance {
                buf: InstanceBuf::Pooled(block),
                stride,
                layout,
                state: Mosi::Shared,
                origin: true,
                holds: 0,
            },
        );
    }

    /// State of the instance at `(i, j, loc)`; `Invalid` if absent
    pub fn state(&self, i: i64, j: i64, loc: MemLoc) -> Mosi {
        self.node(i, j)
            .and_then(|n| n.entry.lock().instance(loc).map(|inst| inst.state))
            .unwrap_or(Mosi::Invalid)
    }

    /// Indices of all catalogued tiles
    pub fn keys(&self) -> Vec<(i64, i64)> {
        self.map.read().keys().copied().collect()
    }

    /// Number of catalogued tiles
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// True when no tiles are catalogued
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Check the coherence invariants of every entry
    pub fn check_all_invariants(&self) -> Result<()> {
        let nodes: Vec<_> = self.map.read().values().cloned().collect();
        for node in nodes {
            node.entry.lock().check_invariants()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with_origin(buf: &mut Vec<f64>) -> TileCatalog<f64> {
        buf.resize(16, 0.0);
        let cat = TileCatalog::new();
        cat.insert_origin(0, 0, 4, 4, buf.as_mut_ptr(), 4, Layout::ColMajor, MemLoc::Host);
        cat
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut buf = Vec::new();
        let cat = catalog_with_origin(&mut buf);

        assert_eq!(cat.state(0, 0, MemLoc::Host), Mosi::Shared);
        assert_eq!(cat.state(0, 0, MemLoc::Device(0)), Mosi::Invalid);
        assert_eq!(cat.state(1, 1, MemLoc::Host), Mosi::Invalid);

        let node = cat.node(0, 0).unwrap();
        let entry = node.entry.lock();
        assert!(entry.instance(MemLoc::Host).unwrap().is_origin());
        assert_eq!(entry.origin_loc(), Some(MemLoc::Host));
    }

    #[test]
    fn test_erase_rules() {
        let mut buf = Vec::new();
        let cat = catalog_with_origin(&mut buf);
        let node = cat.node(0, 0).unwrap();
        let mut entry = node.entry.lock();

        // origin may never be erased
        assert!(entry.remove(MemLoc::Host).is_err());
        // absent instance is an invariant error, not a panic
        assert!(entry.remove(MemLoc::Device(3)).is_err());
    }

    #[test]
    fn test_invariant_detects_double_modified() {
        let mut buf = Vec::new();
        let cat = catalog_with_origin(&mut buf);
        let node = cat.node(0, 0).unwrap();

        let mut aux = vec![0.0f64; 16];
        {
            let mut entry = node.entry.lock();
            entry.instance_mut(MemLoc::Host).unwrap().state = Mosi::Modified;
            entry.insert(
                MemLoc::Device(0),
                TileInstance {
                    buf: InstanceBuf::External(aux.as_mut_ptr()),
                    stride: 4,
                    layout: Layout::ColMajor,
                    state: Mosi::Modified,
                    origin: false,
                    holds: 0,
                },
            );
        }
        assert!(cat.check_all_invariants().is_err());

        node.entry.lock().set_state(MemLoc::Device(0), Mosi::Invalid);
        assert!(cat.check_all_invariants().is_ok());
    }

    #[test]
    fn test_shared_copies_must_agree() {
        let mut buf = Vec::new();
        let cat = catalog_with_origin(&mut buf);
        let node = cat.node(0, 0).unwrap();

        let mut aux = vec![0.0f64; 16];
        aux[5] = 3.25;
        node.entry.lock().insert(
            MemLoc::Device(0),
            TileInstance {
                buf: InstanceBuf::External(aux.as_mut_ptr()),
                stride: 4,
                layout: Layout::ColMajor,
                state: Mosi::Shared,
                origin: false,
                holds: 0,
            },
        );
        assert!(cat.check_all_invariants().is_err());
    }
}
