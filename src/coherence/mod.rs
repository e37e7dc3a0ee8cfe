//! Coherence engine: MOSI transitions on demand
//!
//! Single entry point per access: [`Coherence::acquire`] produces the
//! tile at the requested location, in the requested layout, in a state
//! compatible with the requested access mode, copying and invalidating
//! as required. All transitions for one tile happen atomically under
//! that tile's catalog lock; no kernel work runs under the lock.
//!
//! The engine never initiates messaging: the remote leg of donor
//! selection is realised by the communication layer, whose receive path
//! installs a workspace instance through [`Coherence::install_received`].

use crate::catalog::{InstanceBuf, Mosi, TileCatalog, TileNode};
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::memory::TilePool;
use crate::tile::{Layout, MemLoc, Tile};
use std::ops::Deref;
use std::sync::Arc;

/// Access mode for a tile acquire
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    /// Shared read; coexists with other readers
    Read,
    /// Exclusive write; prior contents need not survive
    Write,
    /// Exclusive write preserving prior contents
    ReadWrite,
}

/// Borrow of one tile instance produced by an acquire
///
/// Holds the in-flight reference that keeps the instance from being
/// erased; dropping the guard releases it. The coherence state set by
/// the acquire (e.g. `Modified` for writes) outlives the guard.
pub struct TileGuard<T: Scalar> {
    tile: Tile<T>,
    node: Arc<TileNode<T>>,
    loc: MemLoc,
}

impl<T: Scalar> TileGuard<T> {
    /// The tile view (copyable)
    #[inline]
    pub fn tile(&self) -> Tile<T> {
        self.tile
    }

    /// Replace the carried view (matrix views apply op/uplo transforms
    /// to the tile they hand out; the referenced instance is unchanged)
    pub(crate) fn set_view(&mut self, tile: Tile<T>) {
        self.tile = tile;
    }
}

impl<T: Scalar> Deref for TileGuard<T> {
    type Target = Tile<T>;

    fn deref(&self) -> &Tile<T> {
        &self.tile
    }
}

impl<T: Scalar> Drop for TileGuard<T> {
    fn drop(&mut self) {
        let mut entry = self.node.entry.lock();
        if let Some(inst) = entry.instance_mut(self.loc) {
            debug_assert!(inst.holds > 0);
            inst.holds -= 1;
        }
    }
}

/// The per-matrix coherence engine
pub struct Coherence<T: Scalar> {
    catalog: Arc<TileCatalog<T>>,
    pool: Arc<TilePool>,
}

impl<T: Scalar> Coherence<T> {
    /// Create an engine over a catalog, drawing workspace from `pool`
    pub fn new(catalog: Arc<TileCatalog<T>>, pool: Arc<TilePool>) -> Self {
        Self { catalog, pool }
    }

    /// The underlying catalog
    pub fn catalog(&self) -> &Arc<TileCatalog<T>> {
        &self.catalog
    }

    /// The pool workspace is drawn from
    pub fn pool(&self) -> &Arc<TilePool> {
        &self.pool
    }

    fn node(&self, i: i64, j: i64) -> Result<Arc<TileNode<T>>> {
        self.catalog
            .node(i, j)
            .ok_or_else(|| Error::invariant(format!("acquire of uncatalogued tile ({}, {})", i, j)))
    }

    /// Produce tile `(i, j)` at `loc` for `access` in `layout`.
    pub fn acquire(
        &self,
        i: i64,
        j: i64,
        loc: MemLoc,
        access: Access,
        layout: Layout,
    ) -> Result<TileGuard<T>> {
        let node = self.node(i, j)?;
        {
            let mut entry = node.entry.lock();
            let (mb, nb) = (entry.mb, entry.nb);

            // Materialise the instance slot at the target location.
            if entry.instance(loc).is_none() {
                let block = self
                    .pool
                    .acquire(loc, (mb * nb) as usize * std::mem::size_of::<T>())?;
                let stride = match layout {
                    Layout::ColMajor => mb,
                    Layout::RowMajor => nb,
                };
                entry.insert(
                    loc,
                    crate::catalog::TileInstance {
                        buf: InstanceBuf::Pooled(block),
                        stride,
                        layout,
                        state: Mosi::Invalid,
                        origin: false,
                        holds: 0,
                    },
                );
            }

            let modified_elsewhere = entry
                .instances
                .iter()
                .any(|(l, inst)| *l != loc && inst.state == Mosi::Modified);
            let here = entry.instance(loc).expect("just materialised");
            let content_valid = here.state.is_valid() && !modified_elsewhere;

            if !content_valid {
                match self.fetch_from_donor(&mut entry, loc, access) {
                    Ok(()) => {}
                    Err(e) if access == Access::Write => {
                        // A pure overwrite may start from a blank
                        // (zero-filled) buffer when no donor exists.
                        log::trace!("write acquire of ({}, {}) without donor: {}", i, j, e);
                    }
                    Err(e) => return Err(e),
                }
            }

            self.convert_layout(&mut entry, loc, layout)?;

            match access {
                Access::Read => {
                    let inst = entry.instance_mut(loc).unwrap();
                    if inst.state == Mosi::Invalid {
                        inst.state = Mosi::Shared;
                    }
                }
                Access::Write | Access::ReadWrite => {
                    for (l, inst) in entry.instances.iter_mut() {
                        if *l != loc && inst.state == Mosi::Shared {
                            inst.state = Mosi::Invalid;
                        } else if *l != loc && inst.state == Mosi::Modified {
                            // moved here by fetch_from_donor
                            inst.state = Mosi::Invalid;
                        }
                    }
                    entry.instance_mut(loc).unwrap().state = Mosi::Modified;
                }
            }

            entry.instance_mut(loc).unwrap().holds += 1;
            log::trace!("acquire ({}, {}) at {} for {:?}", i, j, loc, access);
        }

        let tile = {
            let entry = node.entry.lock();
            entry.tile(loc).unwrap()
        };
        Ok(TileGuard { tile, node, loc })
    }

    /// Copy valid contents into the instance at `loc` from the best
    /// local donor: the `Modified` copy if one exists, else host, else
    /// the lowest-indexed device holding a valid copy.
    fn fetch_from_donor(
        &self,
        entry: &mut crate::catalog::TileEntry<T>,
        loc: MemLoc,
        access: Access,
    ) -> Result<()> {
        let mut donors: Vec<(MemLoc, Mosi)> = entry
            .instances
            .iter()
            .filter(|(l, inst)| *l != loc && inst.state.is_valid())
            .map(|(l, inst)| (*l, inst.state))
            .collect();
        donors.sort_by_key(|(l, s)| {
            let state_rank = if *s == Mosi::Modified { 0 } else { 1 };
            let loc_rank = match l {
                MemLoc::Host => 0u64,
                MemLoc::Device(d) => 1 + u64::from(*d),
            };
            (state_rank, loc_rank)
        });
        // A Modified copy elsewhere shadows any stale valid state here.
        let has_modified = donors.iter().any(|(_, s)| *s == Mosi::Modified);
        let donor = donors
            .iter()
            .find(|(_, s)| *s == Mosi::Modified || !has_modified)
            .map(|(l, _)| *l);

        let donor_loc = donor.ok_or_else(|| {
            Error::invariant(format!("no valid local donor for instance at {}", loc))
        })?;

        let src = entry.tile(donor_loc).unwrap();
        let dst = entry.tile(loc).unwrap();
        src.copy_to(&dst);

        // Reading alongside a Modified donor downgrades it to Shared;
        // writing will invalidate it in the transition step.
        if access == Access::Read {
            let donor_inst = entry.instance_mut(donor_loc).unwrap();
            if donor_inst.state == Mosi::Modified {
                donor_inst.state = Mosi::Shared;
            }
        }
        let here = entry.instance_mut(loc).unwrap();
        here.state = Mosi::Shared;
        Ok(())
    }

    /// Convert the instance at `loc` to `layout`, transposing contents
    /// when they are valid.
    fn convert_layout(
        &self,
        entry: &mut crate::catalog::TileEntry<T>,
        loc: MemLoc,
        layout: Layout,
    ) -> Result<()> {
        let (mb, nb) = (entry.mb, entry.nb);
        let inst = entry.instance(loc).unwrap();
        if inst.layout == layout {
            return Ok(());
        }
        let new_stride = match layout {
            Layout::ColMajor => mb,
            Layout::RowMajor => nb,
        };
        let valid = inst.state.is_valid();
        let external = matches!(inst.buf, InstanceBuf::External(_));

        if external {
            // Origin buffers cannot be reallocated; transpose through a
            // staging copy and require the stride to cover the new
            // leading dimension.
            let inst = entry.instance(loc).unwrap();
            if inst.stride < new_stride {
                return Err(Error::invariant(format!(
                    "layout conversion needs stride {} but origin has {}",
                    new_stride, inst.stride
                )));
            }
            if valid {
                let old = entry.tile(loc).unwrap();
                let mut staged = vec![T::zero(); (mb * nb) as usize];
                for j in 0..nb {
                    for i in 0..mb {
                        staged[(j * mb + i) as usize] = old.get(i, j);
                    }
                }
                let inst = entry.instance_mut(loc).unwrap();
                inst.layout = layout;
                let new = entry.tile(loc).unwrap();
                for j in 0..nb {
                    for i in 0..mb {
                        new.set_elem(i, j, staged[(j * mb + i) as usize]);
                    }
                }
            } else {
                entry.instance_mut(loc).unwrap().layout = layout;
            }
            return Ok(());
        }

        if valid {
            let bytes = (mb * nb) as usize * std::mem::size_of::<T>();
            let block = self.pool.acquire(loc, bytes)?;
            let src = entry.tile(loc).unwrap();
            let dst = Tile::new(block.as_ptr(), mb, nb, new_stride, layout, loc, false);
            src.copy_to(&dst);
            let inst = entry.instance_mut(loc).unwrap();
            let old = std::mem::replace(&mut inst.buf, InstanceBuf::Pooled(block));
            inst.layout = layout;
            inst.stride = new_stride;
            if let InstanceBuf::Pooled(old_block) = old {
                self.pool.release(old_block);
            }
        } else {
            let inst = entry.instance_mut(loc).unwrap();
            inst.layout = layout;
            inst.stride = new_stride;
        }
        Ok(())
    }

    /// Pin the instance at `loc`: `Shared` becomes `OnHold`.
    pub fn hold(&self, i: i64, j: i64, loc: MemLoc) -> Result<()> {
        let node = self.node(i, j)?;
        let mut entry = node.entry.lock();
        if let Some(inst) = entry.instance_mut(loc) {
            if inst.state == Mosi::Shared {
                inst.state = Mosi::OnHold;
            }
        }
        Ok(())
    }

    /// Unpin the instance at `loc`: `OnHold` reverts to `Shared`.
    pub fn unhold(&self, i: i64, j: i64, loc: MemLoc) -> Result<()> {
        let node = self.node(i, j)?;
        let mut entry = node.entry.lock();
        if let Some(inst) = entry.instance_mut(loc) {
            if inst.state == Mosi::OnHold {
                inst.state = Mosi::Shared;
            }
        }
        Ok(())
    }

    /// Serialize the contents of `(i, j)` from the best valid instance.
    ///
    /// Used by the send side of tile movement. No valid instance is the
    /// §4.4 failure mode: an internal invariant violation.
    pub fn pack_for_send(&self, i: i64, j: i64) -> Result<Vec<u8>> {
        let node = self.node(i, j)?;
        let entry = node.entry.lock();
        let mut locs: Vec<MemLoc> = entry
            .instances
            .iter()
            .filter(|(_, inst)| inst.state.is_valid())
            .map(|(l, _)| *l)
            .collect();
        locs.sort_by_key(|l| {
            let inst = entry.instance(*l).unwrap();
            let state_rank = if inst.state == Mosi::Modified { 0 } else { 1 };
            (state_rank, *l)
        });
        let loc = locs.first().copied().ok_or_else(|| {
            Error::invariant(format!("send of tile ({}, {}) with no valid instance", i, j))
        })?;
        let tile = entry.tile(loc).unwrap();
        let mut out = Vec::new();
        tile.pack_into(&mut out);
        Ok(out)
    }

    /// Install received contents at `(i, j, loc)`.
    ///
    /// Creates (or reuses) a workspace instance, overwrites it, and ends
    /// in `Shared` — unless the instance was already `Modified`, in
    /// which case it stays `Modified` (reduction trees receive into
    /// their accumulator). Other local copies are invalidated.
    pub fn install_received(
        &self,
        i: i64,
        j: i64,
        loc: MemLoc,
        layout: Layout,
        bytes: &[u8],
    ) -> Result<()> {
        let node = self.node(i, j)?;
        let mut entry = node.entry.lock();
        let (mb, nb) = (entry.mb, entry.nb);

        if entry.instance(loc).is_none() {
            let block = self
                .pool
                .acquire(loc, (mb * nb) as usize * std::mem::size_of::<T>())?;
            let stride = match layout {
                Layout::ColMajor => mb,
                Layout::RowMajor => nb,
            };
            entry.insert(
                loc,
                crate::catalog::TileInstance {
                    buf: InstanceBuf::Pooled(block),
                    stride,
                    layout,
                    state: Mosi::Invalid,
                    origin: false,
                    holds: 0,
                },
            );
        }
        self.convert_layout(&mut entry, loc, layout)?;

        let was_modified = entry.instance(loc).unwrap().state == Mosi::Modified;
        let tile = entry.tile(loc).unwrap();
        tile.unpack_from(bytes);

        for (l, inst) in entry.instances.iter_mut() {
            if *l != loc && matches!(inst.state, Mosi::Shared | Mosi::Modified) {
                inst.state = Mosi::Invalid;
            }
        }
        entry.instance_mut(loc).unwrap().state = if was_modified {
            Mosi::Modified
        } else {
            Mosi::Shared
        };
        log::trace!("received ({}, {}) into {} ({:?})", i, j, loc, layout);
        Ok(())
    }

    /// Force the origin instance of `(i, j)` coherent with the live copy.
    ///
    /// Pulls from a `Modified` instance elsewhere (which is invalidated),
    /// or from any valid copy when the origin itself is stale. A tile
    /// with no origin instance on this rank is left untouched.
    pub fn update_origin(&self, i: i64, j: i64) -> Result<()> {
        let node = match self.catalog.node(i, j) {
            Some(n) => n,
            None => return Ok(()),
        };
        let mut entry = node.entry.lock();
        let origin_loc = match entry.origin_loc() {
            Some(l) => l,
            None => return Ok(()),
        };

        let modified_elsewhere = entry
            .instances
            .iter()
            .find(|(l, inst)| *l != origin_loc && inst.state == Mosi::Modified)
            .map(|(l, _)| *l);

        if let Some(src_loc) = modified_elsewhere {
            let src = entry.tile(src_loc).unwrap();
            let dst = entry.tile(origin_loc).unwrap();
            src.copy_to(&dst);
            entry.instance_mut(src_loc).unwrap().state = Mosi::Invalid;
            entry.instance_mut(origin_loc).unwrap().state = Mosi::Modified;
            return Ok(());
        }

        let origin_state = entry.instance(origin_loc).unwrap().state;
        if origin_state == Mosi::Invalid {
            let donor = entry
                .instances
                .iter()
                .find(|(l, inst)| *l != origin_loc && inst.state.is_valid())
                .map(|(l, _)| *l)
                .ok_or_else(|| {
                    Error::invariant(format!("origin of ({}, {}) stale with no live copy", i, j))
                })?;
            let src = entry.tile(donor).unwrap();
            let dst = entry.tile(origin_loc).unwrap();
            src.copy_to(&dst);
            entry.instance_mut(origin_loc).unwrap().state = Mosi::Shared;
        }
        Ok(())
    }

    /// Drop every erasable non-origin instance of `(i, j)`, returning
    /// slabs to the pool. `Modified`, `OnHold` (pinned), and referenced
    /// instances survive.
    pub fn release_workspace_tile(&self, i: i64, j: i64) -> Result<()> {
        let node = match self.catalog.node(i, j) {
            Some(n) => n,
            None => return Ok(()),
        };
        let mut entry = node.entry.lock();
        let victims: Vec<MemLoc> = entry
            .instances
            .iter()
            .filter(|(_, inst)| {
                inst.holds == 0
                    && !inst.origin
                    && !matches!(inst.state, Mosi::Modified | Mosi::OnHold)
            })
            .map(|(l, _)| *l)
            .collect();
        for loc in victims {
            let inst = entry.remove(loc)?;
            if let InstanceBuf::Pooled(block) = inst.buf {
                self.pool.release(block);
            }
        }
        Ok(())
    }

    /// Discard every instance of a tile whose origin lives on another
    /// rank, including a locally `Modified` remote accumulator.
    pub fn release_remote_workspace_tile(&self, i: i64, j: i64) -> Result<()> {
        let node = match self.catalog.node(i, j) {
            Some(n) => n,
            None => return Ok(()),
        };
        let mut entry = node.entry.lock();
        if entry.origin_loc().is_some() {
            return Err(Error::invariant(format!(
                "remote workspace release of locally-owned tile ({}, {})",
                i, j
            )));
        }
        let victims: Vec<MemLoc> = entry
            .instances
            .iter()
            .filter(|(_, inst)| inst.holds == 0)
            .map(|(l, _)| *l)
            .collect();
        for loc in victims {
            // contents are intentionally discarded
            entry.instance_mut(loc).unwrap().state = Mosi::Invalid;
            let inst = entry.remove(loc)?;
            if let InstanceBuf::Pooled(block) = inst.buf {
                self.pool.release(block);
            }
        }
        Ok(())
    }
}
