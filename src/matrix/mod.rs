//! Distributed tiled matrices and their views
//!
//! A [`Matrix`] is an O(1) view over shared [`MatrixStorage`]: a pair of
//! (possibly strided) tile-index ranges, a logical transposition, and an
//! optional triangle restriction. Views compose (`transpose(sub(..))`)
//! and share one tile catalog; they never own or copy tiles.

mod storage;
mod views;

pub use storage::{DeviceFn, MatrixStorage, OwnerFn, TileDimFn};
pub(crate) use views::tile_in_band;
pub use views::{
    BandMatrix, HermitianBandMatrix, HermitianMatrix, SymmetricMatrix, TriangularBandMatrix,
    TriangularFactors, TriangularMatrix,
};

use crate::coherence::{Access, TileGuard};
use crate::comm::{self, BcastItem, TagRange, Transport};
use crate::device::DeviceRegistry;
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::tile::{Diag, Layout, MemLoc, Op, Uplo};
use std::sync::Arc;

/// Broadcast work list: `(i, j, destination views)` per tile
///
/// Mirrors the driver idiom of sending a factored tile across the views
/// it will update; the destination rank set of each item is the union of
/// the owning ranks of the listed views.
pub type BcastList<T> = Vec<(i64, i64, Vec<Matrix<T>>)>;

#[derive(Copy, Clone, Debug)]
struct ViewRange {
    offset: i64,
    count: i64,
    step: i64,
}

impl ViewRange {
    fn full(count: i64) -> Self {
        Self {
            offset: 0,
            count,
            step: 1,
        }
    }

    #[inline]
    fn at(&self, k: i64) -> i64 {
        debug_assert!(k >= 0 && k < self.count, "tile index {} of {}", k, self.count);
        self.offset + k * self.step
    }

    fn narrowed(&self, first: i64, last: i64) -> Self {
        debug_assert!(first >= 0 && last < self.count && first <= last + 1);
        Self {
            offset: self.at(first.min(self.count - 1)),
            count: last - first + 1,
            step: self.step,
        }
    }

    fn strided(&self, first: i64, count: i64, step: i64) -> Self {
        debug_assert!(step >= 1);
        debug_assert!(count == 0 || first + (count - 1) * step < self.count);
        Self {
            offset: self.offset + first * self.step,
            count,
            step: self.step * step,
        }
    }
}

/// General distributed tiled matrix (a view over shared storage)
pub struct Matrix<T: Scalar> {
    storage: Arc<MatrixStorage<T>>,
    rows: ViewRange,
    cols: ViewRange,
    op: Op,
    uplo: Uplo, // storage-side; logical accessor follows `op`
    diag: Diag,
}

impl<T: Scalar> Clone for Matrix<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            rows: self.rows,
            cols: self.cols,
            op: self.op,
            uplo: self.uplo,
            diag: self.diag,
        }
    }
}

impl<T: Scalar> Matrix<T> {
    /// Uniform-tile matrix on a `p x q` block-cyclic grid with no devices
    pub fn new(
        m: i64,
        n: i64,
        nb: i64,
        p: usize,
        q: usize,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::with_tile_fns(
            m,
            n,
            Arc::new(move |_| nb),
            Arc::new(move |_| nb),
            (p, q),
            MatrixStorage::<T>::block_cyclic_owner(p, q),
            Arc::new(|_, _| 0),
            transport,
            Arc::new(DeviceRegistry::host_only()),
        )
    }

    /// Fully-parameterised constructor: tile-extent functions, grid,
    /// ownership, device affinity, transport, and device registry.
    #[allow(clippy::too_many_arguments)]
    pub fn with_tile_fns(
        m: i64,
        n: i64,
        tile_mb: TileDimFn,
        tile_nb: TileDimFn,
        grid: (usize, usize),
        owner: OwnerFn,
        device_of: DeviceFn,
        transport: Arc<dyn Transport>,
        devices: Arc<DeviceRegistry>,
    ) -> Result<Self> {
        if m <= 0 || n <= 0 {
            return Err(Error::invalid_arg("m/n", "matrix extents must be positive"));
        }
        if grid.0 * grid.1 > transport.size() {
            return Err(Error::invalid_arg("grid", "p*q exceeds the communicator size"));
        }
        let storage = MatrixStorage::new(
            m, n, tile_mb, tile_nb, grid, owner, device_of, transport, devices,
        );
        let (mt, nt) = (storage.mt, storage.nt);
        Ok(Self {
            storage,
            rows: ViewRange::full(mt),
            cols: ViewRange::full(nt),
            op: Op::NoTrans,
            uplo: Uplo::General,
            diag: Diag::NonUnit,
        })
    }

    /// Wrap ScaLAPACK-style column-major block-cyclic user storage.
    ///
    /// Tile `(i, j)` is owned by rank `(i mod p) + (j mod q) * p`; origin
    /// tiles point straight into `data` with stride `lld` (the local
    /// leading dimension).
    ///
    /// # Safety
    ///
    /// `data` must cover this rank's local blocks for the lifetime of the
    /// matrix, and nothing else may alias it while the engine runs.
    pub unsafe fn from_scalapack(
        m: i64,
        n: i64,
        data: *mut T,
        lld: i64,
        nb: i64,
        p: usize,
        q: usize,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        if nb <= 0 {
            return Err(Error::invalid_arg("nb", "block size must be positive"));
        }
        let a = Self::new(m, n, nb, p, q, transport)?;
        let rank = a.storage.transport.rank();
        let (myrow, mycol) = (rank % p, rank / p);

        for j in 0..a.storage.nt {
            for i in 0..a.storage.mt {
                if a.storage.tile_rank(i, j) != rank {
                    continue;
                }
                debug_assert_eq!((i as usize % p, j as usize % q), (myrow, mycol));
                let li = i / p as i64;
                let lj = j / q as i64;
                let ptr = data.offset((lj * nb * lld + li * nb) as isize);
                a.storage.coherence.catalog().insert_origin(
                    i,
                    j,
                    a.storage.tile_mb(i),
                    a.storage.tile_nb(j),
                    ptr,
                    lld,
                    Layout::ColMajor,
                    MemLoc::Host,
                );
            }
        }
        Ok(a)
    }

    /// Allocate pool-backed origin tiles for every local tile
    pub fn insert_local_tiles(&self) -> Result<()> {
        let st = &self.storage;
        for j in 0..st.nt {
            for i in 0..st.mt {
                if st.tile_is_local(i, j) {
                    let (mb, nb) = (st.tile_mb(i), st.tile_nb(j));
                    let block = st
                        .coherence
                        .pool()
                        .acquire(MemLoc::Host, (mb * nb) as usize * std::mem::size_of::<T>())?;
                    st.coherence.catalog().insert_origin_pooled(
                        i,
                        j,
                        mb,
                        nb,
                        block,
                        mb,
                        Layout::ColMajor,
                        MemLoc::Host,
                    );
                }
            }
        }
        Ok(())
    }

    // ---- geometry -------------------------------------------------------

    /// Logical tile rows
    #[inline]
    pub fn mt(&self) -> i64 {
        match self.op {
            Op::NoTrans => self.rows.count,
            _ => self.cols.count,
        }
    }

    /// Logical tile columns
    #[inline]
    pub fn nt(&self) -> i64 {
        match self.op {
            Op::NoTrans => self.cols.count,
            _ => self.rows.count,
        }
    }

    /// Logical element rows
    pub fn m(&self) -> i64 {
        (0..self.mt()).map(|i| self.tile_mb(i)).sum()
    }

    /// Logical element columns
    pub fn n(&self) -> i64 {
        (0..self.nt()).map(|j| self.tile_nb(j)).sum()
    }

    /// Rows of logical tile row `i`
    #[inline]
    pub fn tile_mb(&self, i: i64) -> i64 {
        match self.op {
            Op::NoTrans => self.storage.tile_mb(self.rows.at(i)),
            _ => self.storage.tile_nb(self.cols.at(i)),
        }
    }

    /// Columns of logical tile column `j`
    #[inline]
    pub fn tile_nb(&self, j: i64) -> i64 {
        match self.op {
            Op::NoTrans => self.storage.tile_nb(self.cols.at(j)),
            _ => self.storage.tile_mb(self.rows.at(j)),
        }
    }

    #[inline]
    fn map(&self, i: i64, j: i64) -> (i64, i64) {
        match self.op {
            Op::NoTrans => (self.rows.at(i), self.cols.at(j)),
            _ => (self.rows.at(j), self.cols.at(i)),
        }
    }

    /// Owning rank of logical tile `(i, j)`
    #[inline]
    pub fn tile_rank(&self, i: i64, j: i64) -> usize {
        let (si, sj) = self.map(i, j);
        self.storage.tile_rank(si, sj)
    }

    /// True when logical tile `(i, j)` is owned by this rank
    #[inline]
    pub fn tile_is_local(&self, i: i64, j: i64) -> bool {
        let (si, sj) = self.map(i, j);
        self.storage.tile_is_local(si, sj)
    }

    /// Device affinity of logical tile `(i, j)`
    #[inline]
    pub fn tile_device(&self, i: i64, j: i64) -> u32 {
        let (si, sj) = self.map(i, j);
        self.storage.tile_device(si, sj)
    }

    /// Memory location the `Devices` target uses for tile `(i, j)`
    pub fn tile_device_loc(&self, i: i64, j: i64) -> MemLoc {
        let (si, sj) = self.map(i, j);
        self.storage.tile_device_loc(si, sj)
    }

    /// Logical transposition of this view
    #[inline]
    pub fn op(&self) -> Op {
        self.op
    }

    /// Logical triangle restriction of this view
    #[inline]
    pub fn uplo(&self) -> Uplo {
        match self.op {
            Op::NoTrans => self.uplo,
            _ => self.uplo.flipped(),
        }
    }

    /// Diagonal kind of this view
    #[inline]
    pub fn diag(&self) -> Diag {
        self.diag
    }

    /// This rank in the matrix's communicator
    #[inline]
    pub fn rank(&self) -> usize {
        self.storage.transport.rank()
    }

    /// The matrix's transport endpoint
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.storage.transport
    }

    /// The matrix's tag pool
    pub fn tags(&self) -> &crate::comm::TagPool {
        &self.storage.tags
    }

    /// The matrix's device registry
    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.storage.devices
    }

    /// Process grid `(p, q)`
    pub fn grid(&self) -> (usize, usize) {
        self.storage.grid
    }

    /// True when both views share storage (and therefore a catalog)
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    // ---- view algebra ---------------------------------------------------

    /// Sub-matrix over logical tile ranges `i1..=i2`, `j1..=j2`
    pub fn sub(&self, i1: i64, i2: i64, j1: i64, j2: i64) -> Self {
        let mut out = self.clone();
        match self.op {
            Op::NoTrans => {
                out.rows = self.rows.narrowed(i1, i2);
                out.cols = self.cols.narrowed(j1, j2);
            }
            _ => {
                out.rows = self.rows.narrowed(j1, j2);
                out.cols = self.cols.narrowed(i1, i2);
            }
        }
        out
    }

    /// Strided slice: logical tile ranges as `(first, count, step)`
    pub fn slice_tiles(&self, row: (i64, i64, i64), col: (i64, i64, i64)) -> Self {
        let mut out = self.clone();
        match self.op {
            Op::NoTrans => {
                out.rows = self.rows.strided(row.0, row.1, row.2);
                out.cols = self.cols.strided(col.0, col.1, col.2);
            }
            _ => {
                out.rows = self.rows.strided(col.0, col.1, col.2);
                out.cols = self.cols.strided(row.0, row.1, row.2);
            }
        }
        out
    }

    /// Transposed view
    pub fn transpose(&self) -> Self {
        let mut out = self.clone();
        out.op = match self.op {
            Op::NoTrans => Op::Trans,
            Op::Trans => Op::NoTrans,
            Op::ConjTrans => unreachable!("transpose of a conj-transposed view"),
        };
        out
    }

    /// Conjugate-transposed view
    pub fn conj_transpose(&self) -> Self {
        let mut out = self.clone();
        out.op = match self.op {
            Op::NoTrans => Op::ConjTrans,
            Op::ConjTrans => Op::NoTrans,
            Op::Trans => unreachable!("conj-transpose of a transposed view"),
        };
        out
    }

    pub(crate) fn with_uplo(&self, uplo: Uplo, diag: Diag) -> Self {
        let mut out = self.clone();
        out.uplo = match self.op {
            Op::NoTrans => uplo,
            _ => uplo.flipped(),
        };
        out.diag = diag;
        out
    }

    /// New matrix with this view's geometry and distribution, empty
    /// catalog (tiles materialise as workspace on first write).
    pub fn empty_like(&self) -> Result<Self> {
        let mbs: Vec<i64> = (0..self.mt()).map(|i| self.tile_mb(i)).collect();
        let nbs: Vec<i64> = (0..self.nt()).map(|j| self.tile_nb(j)).collect();
        let owner_src = self.clone();
        let device_src = self.clone();
        Self::with_tile_fns(
            self.m(),
            self.n(),
            Arc::new(move |i| mbs[i as usize]),
            Arc::new(move |j| nbs[j as usize]),
            self.storage.grid,
            Arc::new(move |i, j| owner_src.tile_rank(i, j)),
            Arc::new(move |i, j| device_src.tile_device(i, j)),
            self.storage.transport.clone(),
            self.storage.devices.clone(),
        )
    }

    // ---- tile access ----------------------------------------------------

    fn acquire(
        &self,
        i: i64,
        j: i64,
        loc: MemLoc,
        access: Access,
        layout: Layout,
    ) -> Result<TileGuard<T>> {
        let (si, sj) = self.map(i, j);
        self.storage.ensure_node(si, sj);
        let mut guard = self.storage.coherence.acquire(si, sj, loc, access, layout)?;
        let mut tile = guard.tile();
        tile = match self.op {
            Op::NoTrans => tile,
            Op::Trans => tile.transpose(),
            Op::ConjTrans => tile.conj_transpose(),
        };
        if self.uplo() != Uplo::General && i == j {
            tile = tile.with_uplo(self.uplo(), self.diag);
        }
        guard.set_view(tile);
        Ok(guard)
    }

    /// Acquire tile `(i, j)` on the host for reading
    pub fn tile_get_for_reading(&self, i: i64, j: i64, layout: Layout) -> Result<TileGuard<T>> {
        self.acquire(i, j, MemLoc::Host, Access::Read, layout)
    }

    /// Acquire tile `(i, j)` on the host for writing, preserving content
    pub fn tile_get_for_writing(&self, i: i64, j: i64, layout: Layout) -> Result<TileGuard<T>> {
        self.acquire(i, j, MemLoc::Host, Access::ReadWrite, layout)
    }

    /// Acquire tile `(i, j)` on the host for a full overwrite
    pub fn tile_get_for_overwrite(&self, i: i64, j: i64, layout: Layout) -> Result<TileGuard<T>> {
        self.acquire(i, j, MemLoc::Host, Access::Write, layout)
    }

    /// Acquire tile `(i, j)` at an explicit location for reading
    pub fn tile_get_for_reading_on(
        &self,
        i: i64,
        j: i64,
        loc: MemLoc,
        layout: Layout,
    ) -> Result<TileGuard<T>> {
        self.acquire(i, j, loc, Access::Read, layout)
    }

    /// Acquire tile `(i, j)` at an explicit location for writing
    pub fn tile_get_for_writing_on(
        &self,
        i: i64,
        j: i64,
        loc: MemLoc,
        layout: Layout,
    ) -> Result<TileGuard<T>> {
        self.acquire(i, j, loc, Access::ReadWrite, layout)
    }

    /// Read-acquire shorthand (host, ColMajor)
    pub fn tile(&self, i: i64, j: i64) -> Result<TileGuard<T>> {
        self.tile_get_for_reading(i, j, Layout::ColMajor)
    }

    /// Schedule write coherence for every local tile of the view on the
    /// host in one pass
    pub fn tile_get_all_for_writing(&self, layout: Layout) -> Result<()> {
        for (i, j) in self.local_tiles() {
            self.tile_get_for_writing(i, j, layout)?;
        }
        Ok(())
    }

    /// Schedule write coherence for every local tile of the view on its
    /// affine device in one pass
    pub fn tile_get_all_for_writing_on_devices(&self, layout: Layout) -> Result<()> {
        for (i, j) in self.local_tiles() {
            let loc = self.tile_device_loc(i, j);
            self.acquire(i, j, loc, Access::ReadWrite, layout)?;
        }
        Ok(())
    }

    /// Logical indices of every tile in the view
    pub fn tiles(&self) -> Vec<(i64, i64)> {
        let mut out = Vec::with_capacity((self.mt() * self.nt()) as usize);
        for j in 0..self.nt() {
            for i in 0..self.mt() {
                out.push((i, j));
            }
        }
        out
    }

    /// Logical indices of this rank's tiles in the view
    pub fn local_tiles(&self) -> Vec<(i64, i64)> {
        self.tiles()
            .into_iter()
            .filter(|&(i, j)| self.tile_is_local(i, j))
            .collect()
    }

    /// Owning ranks of the view's tiles, ascending and deduplicated
    pub fn ranks(&self) -> Vec<usize> {
        let mut out: Vec<usize> = self.tiles().iter().map(|&(i, j)| self.tile_rank(i, j)).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    // ---- communication --------------------------------------------------

    /// Send tile `(i, j)` to `dst`
    pub fn tile_send(&self, i: i64, j: i64, dst: usize, tag: u32) -> Result<()> {
        let (si, sj) = self.map(i, j);
        comm::tile_send(&self.storage.coherence, &self.storage.transport, si, sj, dst, tag)
    }

    /// Receive tile `(i, j)` from `src` into a workspace instance
    pub fn tile_recv(&self, i: i64, j: i64, src: usize, layout: Layout, tag: u32) -> Result<()> {
        let (si, sj) = self.map(i, j);
        self.storage.ensure_node(si, sj);
        comm::tile_recv(
            &self.storage.coherence,
            &self.storage.transport,
            si,
            sj,
            src,
            layout,
            tag,
        )
    }

    /// Broadcast each listed tile to the ranks owning the listed views.
    ///
    /// Tags are taken from `tags` at `tag_base` plus the item position.
    pub fn list_bcast(
        &self,
        list: &BcastList<T>,
        layout: Layout,
        tags: &TagRange,
        tag_base: u32,
    ) -> Result<()> {
        let items: Vec<BcastItem> = list
            .iter()
            .map(|(i, j, views)| {
                let (si, sj) = self.map(*i, *j);
                let mut ranks: Vec<usize> = views.iter().flat_map(|v| v.ranks()).collect();
                ranks.sort_unstable();
                ranks.dedup();
                BcastItem {
                    i: si,
                    j: sj,
                    root: self.tile_rank(*i, *j),
                    ranks,
                }
            })
            .collect();
        for item in &items {
            // receivers materialise workspace entries on demand
            self.storage
                .coherence
                .catalog()
                .node_or_insert(item.i, item.j, self.storage.tile_mb(item.i), self.storage.tile_nb(item.j));
        }
        comm::list_bcast(
            &self.storage.coherence,
            &self.storage.transport,
            &items,
            layout,
            tags,
            tag_base,
        )
    }

    // ---- origin & workspace ---------------------------------------------

    /// Make the origin instance of tile `(i, j)` coherent
    pub fn tile_update_origin(&self, i: i64, j: i64) -> Result<()> {
        let (si, sj) = self.map(i, j);
        self.storage.coherence.update_origin(si, sj)
    }

    /// Make every local origin instance in the view coherent
    pub fn tile_update_all_origin(&self) -> Result<()> {
        for (i, j) in self.local_tiles() {
            self.tile_update_origin(i, j)?;
        }
        Ok(())
    }

    /// Release workspace instances of locally-owned tile `(i, j)`
    pub fn release_local_workspace_tile(&self, i: i64, j: i64) -> Result<()> {
        let (si, sj) = self.map(i, j);
        self.storage.coherence.release_workspace_tile(si, sj)
    }

    /// Discard the remote-received instances of tile `(i, j)`
    pub fn release_remote_workspace_tile(&self, i: i64, j: i64) -> Result<()> {
        let (si, sj) = self.map(i, j);
        self.storage.coherence.release_remote_workspace_tile(si, sj)
    }

    /// Release every workspace instance of the whole matrix
    pub fn release_workspace(&self) -> Result<()> {
        for (si, sj) in self.storage.coherence.catalog().keys() {
            if self.storage.tile_is_local(si, sj) {
                self.storage.coherence.release_workspace_tile(si, sj)?;
            } else {
                self.storage.coherence.release_remote_workspace_tile(si, sj)?;
            }
        }
        Ok(())
    }

    // ---- element-level conveniences -------------------------------------

    /// Locate the tile row and in-tile offset of global element row `gi`
    pub fn tile_row_of(&self, gi: i64) -> (i64, i64) {
        let mut at = 0;
        for i in 0..self.mt() {
            let mb = self.tile_mb(i);
            if gi < at + mb {
                return (i, gi - at);
            }
            at += mb;
        }
        panic!("element row {} outside matrix of {} rows", gi, at);
    }

    /// Fill every local tile by global element coordinates
    pub fn fill_local(&self, f: impl Fn(i64, i64) -> T) -> Result<()> {
        let mut row_off = vec![0i64; self.mt() as usize + 1];
        for i in 0..self.mt() {
            row_off[i as usize + 1] = row_off[i as usize] + self.tile_mb(i);
        }
        let mut col_off = vec![0i64; self.nt() as usize + 1];
        for j in 0..self.nt() {
            col_off[j as usize + 1] = col_off[j as usize] + self.tile_nb(j);
        }
        for (i, j) in self.local_tiles() {
            let g = self.tile_get_for_writing(i, j, Layout::ColMajor)?;
            for jj in 0..g.nb() {
                for ii in 0..g.mb() {
                    g.set_elem(ii, jj, f(row_off[i as usize] + ii, col_off[j as usize] + jj));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ChannelTransport;

    fn solo_matrix(m: i64, n: i64, nb: i64) -> Matrix<f64> {
        let t: Arc<dyn Transport> = ChannelTransport::solo();
        let a = Matrix::new(m, n, nb, 1, 1, t).unwrap();
        a.insert_local_tiles().unwrap();
        a
    }

    #[test]
    fn test_geometry_with_edge_tiles() {
        let a = solo_matrix(10, 7, 4);
        assert_eq!(a.mt(), 3);
        assert_eq!(a.nt(), 2);
        assert_eq!(a.tile_mb(2), 2);
        assert_eq!(a.tile_nb(1), 3);
        assert_eq!(a.m(), 10);
        assert_eq!(a.n(), 7);
    }

    #[test]
    fn test_sub_and_transpose_compose() {
        let a = solo_matrix(12, 12, 4);
        a.fill_local(|i, j| (i * 100 + j) as f64).unwrap();

        let s = a.sub(1, 2, 0, 1);
        assert_eq!(s.mt(), 2);
        assert_eq!(s.nt(), 2);
        let g = s.tile(0, 0).unwrap();
        assert_eq!(g.get(0, 0), 400.0); // global (4, 0)
        drop(g);

        let st = s.transpose();
        assert_eq!(st.mt(), 2);
        let g = st.tile(0, 0).unwrap();
        assert_eq!(g.get(0, 0), 400.0);
        assert_eq!(g.get(1, 0), 401.0); // transposed: (row, col) swapped
    }

    #[test]
    fn test_strided_slice() {
        let a = solo_matrix(16, 16, 4);
        let s = a.slice_tiles((0, 2, 2), (1, 2, 2)); // tile rows {0,2}, cols {1,3}
        assert_eq!(s.mt(), 2);
        assert_eq!(s.nt(), 2);
        assert_eq!(s.tile_rank(0, 0), 0);

        let inner = s.sub(1, 1, 0, 1); // tile row {2}, cols {1,3}
        assert_eq!(inner.mt(), 1);
        assert_eq!(inner.nt(), 2);
    }

    #[test]
    fn test_conj_transpose_tile_access() {
        use crate::dtype::Complex64;
        let t: Arc<dyn Transport> = ChannelTransport::solo();
        let a: Matrix<Complex64> = Matrix::new(4, 4, 2, 1, 1, t).unwrap();
        a.insert_local_tiles().unwrap();
        a.fill_local(|i, j| Complex64::new(i as f64, j as f64)).unwrap();

        let ah = a.conj_transpose();
        let g = ah.tile(0, 1).unwrap(); // underlying tile (1, 0)
        assert_eq!(g.get(0, 0), Complex64::new(2.0, -0.0));
        assert_eq!(g.get(1, 1), Complex64::new(3.0, -1.0));
    }

    #[test]
    fn test_empty_like_matches_geometry() {
        let a = solo_matrix(10, 7, 4);
        let w = a.empty_like().unwrap();
        assert_eq!(w.mt(), a.mt());
        assert_eq!(w.nt(), a.nt());
        assert_eq!(w.tile_mb(2), 2);

        // workspace tiles materialise on overwrite
        let g = w.tile_get_for_overwrite(0, 0, Layout::ColMajor).unwrap();
        g.set_elem(0, 0, 4.5);
        drop(g);
        assert_eq!(w.tile(0, 0).unwrap().get(0, 0), 4.5);
    }

    #[test]
    fn test_scalapack_wrap_points_into_user_buffer() {
        let t: Arc<dyn Transport> = ChannelTransport::solo();
        let (m, n, nb) = (6i64, 6i64, 3i64);
        let mut buf = vec![0.0f64; (m * n) as usize];
        // column-major fill: element (i, j) = i + 10 j
        for j in 0..n {
            for i in 0..m {
                buf[(j * m + i) as usize] = (i + 10 * j) as f64;
            }
        }
        let a = unsafe {
            Matrix::from_scalapack(m, n, buf.as_mut_ptr(), m, nb, 1, 1, t).unwrap()
        };
        let g = a.tile(1, 1).unwrap();
        assert_eq!(g.get(0, 0), (3 + 10 * 3) as f64);

        // writes through the engine land in the user buffer
        drop(g);
        let g = a.tile_get_for_writing(1, 1, Layout::ColMajor).unwrap();
        g.set_elem(0, 0, -1.0);
        drop(g);
        a.tile_update_all_origin().unwrap();
        assert_eq!(buf[(3 * m + 3) as usize], -1.0);
    }

    #[test]
    fn test_seed_tile_counts_on_mesh() {
        // non-uniform tile sizes over a 2x2 grid: every rank agrees on
        // the geometry and owns the closed-form tile count
        let mesh = ChannelTransport::mesh(4);
        let handles: Vec<_> = mesh
            .into_iter()
            .map(|t| {
                std::thread::spawn(move || {
                    let transport: Arc<dyn Transport> = t;
                    let rank = transport.rank();
                    let (n, nb) = (100i64, 16i64);
                    let a: Matrix<f64> = Matrix::with_tile_fns(
                        n,
                        n,
                        Arc::new(move |_| nb),
                        Arc::new(move |j| if j % 2 != 0 { nb / 2 } else { nb }),
                        (2, 2),
                        MatrixStorage::<f64>::block_cyclic_owner(2, 2),
                        Arc::new(|_, _| 0),
                        transport,
                        Arc::new(DeviceRegistry::host_only()),
                    )
                    .unwrap();
                    a.insert_local_tiles().unwrap();

                    let total: i64 = (0..a.nt()).map(|j| a.tile_nb(j)).sum();
                    assert_eq!(total, n);

                    let mut count = 0;
                    for j in 0..a.nt() {
                        for i in 0..a.mt() {
                            assert_eq!(
                                a.tile_rank(i, j),
                                (i as usize % 2) + (j as usize % 2) * 2
                            );
                            if a.tile_is_local(i, j) {
                                count += 1;
                            }
                        }
                    }
                    // closed form: rows with i%2==rank%2, cols with j%2==rank/2
                    let my_rows = (0..a.mt()).filter(|i| *i as usize % 2 == rank % 2).count();
                    let my_cols = (0..a.nt()).filter(|j| *j as usize % 2 == rank / 2).count();
                    assert_eq!(count, (my_rows * my_cols) as i64);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
