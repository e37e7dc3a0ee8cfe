//! Internal tile-granular operations
//!
//! The building blocks drivers schedule as tasks: shape-grouped GEMM and
//! rank-k update sweeps with per-target dispatch, trapezoidal fills, and
//! row/column scalings. The panel factorization and triangle-triangle
//! reduction live in [`qr`].

pub(crate) mod qr;

use crate::batch::DeviceBatch;
use crate::dtype::Scalar;
use crate::error::Result;
use crate::kernel::{HostKernels, TileKernels};
use crate::matrix::Matrix;
use crate::options::Target;
use crate::tile::{Layout, MemLoc, Tile, Uplo};
use crate::trace::TraceSpan;
use rayon::prelude::*;

/// One scheduled tile update: `C := alpha A B + beta C`, or a Hermitian
/// rank-k update when `herk` is set (then `B` is ignored and the real
/// parts of the coefficients apply).
pub(crate) struct TileOp<T: Scalar> {
    pub alpha: T,
    pub beta: T,
    pub a: (Matrix<T>, i64, i64),
    pub b: (Matrix<T>, i64, i64),
    pub c: (Matrix<T>, i64, i64),
    pub herk: bool,
}

fn run_one<T: Scalar>(op: &TileOp<T>, loc: Option<MemLoc>) -> Result<()> {
    let (a, ai, aj) = &op.a;
    let (b, bi, bj) = &op.b;
    let (c, ci, cj) = &op.c;
    let (ga, gb, gc);
    match loc {
        None => {
            ga = a.tile_get_for_reading(*ai, *aj, Layout::ColMajor)?;
            gb = b.tile_get_for_reading(*bi, *bj, Layout::ColMajor)?;
            gc = c.tile_get_for_writing(*ci, *cj, Layout::ColMajor)?;
        }
        Some(l) => {
            ga = a.tile_get_for_reading_on(*ai, *aj, l, Layout::ColMajor)?;
            gb = b.tile_get_for_reading_on(*bi, *bj, l, Layout::ColMajor)?;
            gc = c.tile_get_for_writing_on(*ci, *cj, l, Layout::ColMajor)?;
        }
    }
    if op.herk {
        HostKernels::herk(op.alpha.real(), &ga.tile(), op.beta.real(), &gc.tile());
    } else {
        HostKernels::gemm(op.alpha, &ga.tile(), &gb.tile(), op.beta, &gc.tile());
    }
    Ok(())
}

/// Execute a sweep of tile updates under the chosen target.
///
/// `HostTask` runs them in order; `HostNest` fans them out on the
/// current rayon pool; `HostBatch` groups by shape and loops each
/// group; `Devices` acquires device instances, marshals pointer
/// arrays per device, and syncs the compute queue.
pub(crate) fn run_tile_ops<T: Scalar>(
    target: Target,
    ops: Vec<TileOp<T>>,
    queue: usize,
) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    let _span = TraceSpan::new("internal::tile_ops");
    match target {
        Target::HostTask => {
            for op in &ops {
                run_one(op, None)?;
            }
            Ok(())
        }
        Target::HostNest => ops
            .par_iter()
            .map(|op| run_one(op, None))
            .collect::<Result<Vec<_>>>()
            .map(|_| ()),
        Target::HostBatch => {
            // shape-grouped batching on the host: pointer arrays are
            // marshalled exactly as for a device, a per-group side table
            // maps entries back to their tiles for the kernel loop
            let registry = ops[0].c.0.devices().clone();
            let mut batch: DeviceBatch<T> = DeviceBatch::new(0, queue);
            let mut side: Vec<Vec<(Tile<T>, Tile<T>, Tile<T>, usize)>> = Vec::new();
            for (at, op) in ops.iter().enumerate() {
                let (a, ai, aj) = &op.a;
                let (b, bi, bj) = &op.b;
                let (c, ci, cj) = &op.c;
                let ga = a.tile_get_for_reading(*ai, *aj, Layout::ColMajor)?;
                let gb = b.tile_get_for_reading(*bi, *bj, Layout::ColMajor)?;
                let gc = c.tile_get_for_writing(*ci, *cj, Layout::ColMajor)?;
                let set = (ga.tile(), gb.tile(), gc.tile());
                let g = batch.push(&[set.0, set.1, set.2], ci == cj, [ga, gb, gc])?;
                if side.len() <= g {
                    side.resize_with(g + 1, Vec::new);
                }
                side[g].push((set.0, set.1, set.2, at));
            }
            batch.dispatch(&registry, |g, _group| {
                for (ta, tb, tc, at) in &side[g] {
                    let op = &ops[*at];
                    if op.herk {
                        HostKernels::herk(op.alpha.real(), ta, op.beta.real(), tc);
                    } else {
                        HostKernels::gemm(op.alpha, ta, tb, op.beta, tc);
                    }
                }
                Ok(())
            })
        }
        Target::Devices => {
            let registry = ops[0].c.0.devices().clone();
            // one marshaller per target device, with a per-group side
            // table mapping entries back to their tiles
            #[allow(clippy::type_complexity)]
            let mut per_dev: std::collections::HashMap<
                u32,
                (DeviceBatch<T>, Vec<Vec<(Tile<T>, Tile<T>, Tile<T>, usize)>>),
            > = std::collections::HashMap::new();
            for (at, op) in ops.iter().enumerate() {
                let (c, ci, cj) = &op.c;
                let loc = c.tile_device_loc(*ci, *cj);
                let dev = match loc {
                    MemLoc::Device(d) => d,
                    MemLoc::Host => {
                        // no devices present: fall through to host work
                        run_one(op, None)?;
                        continue;
                    }
                };
                let (a, ai, aj) = &op.a;
                let (b, bi, bj) = &op.b;
                let ga = a.tile_get_for_reading_on(*ai, *aj, loc, Layout::ColMajor)?;
                let gb = b.tile_get_for_reading_on(*bi, *bj, loc, Layout::ColMajor)?;
                let gc = c.tile_get_for_writing_on(*ci, *cj, loc, Layout::ColMajor)?;
                let set = (ga.tile(), gb.tile(), gc.tile());
                let entry = per_dev
                    .entry(dev)
                    .or_insert_with(|| (DeviceBatch::new(dev, queue), Vec::new()));
                let g = entry
                    .0
                    .push(&[set.0, set.1, set.2], ci == cj, [ga, gb, gc])?;
                if entry.1.len() <= g {
                    entry.1.resize_with(g + 1, Vec::new);
                }
                entry.1[g].push((set.0, set.1, set.2, at));
            }
            for (_, (batch, side)) in per_dev {
                batch.dispatch(&registry, |g, _group| {
                    for (ta, tb, tc, at) in &side[g] {
                        let op = &ops[*at];
                        if op.herk {
                            HostKernels::herk(op.alpha.real(), ta, op.beta.real(), tc);
                        } else {
                            HostKernels::gemm(op.alpha, ta, tb, op.beta, tc);
                        }
                    }
                    Ok(())
                })?;
            }
            Ok(())
        }
    }
}

/// Scale this rank's tiles of one block-column by `factor`
pub(crate) fn scale_col_local<T: Scalar>(
    factor: T,
    c: &Matrix<T>,
    j: i64,
    lower_only: bool,
) -> Result<()> {
    if factor == T::one() {
        return Ok(());
    }
    for i in 0..c.mt() {
        if (lower_only && i < j) || !c.tile_is_local(i, j) {
            continue;
        }
        let g = c.tile_get_for_writing(i, j, Layout::ColMajor)?;
        for jj in 0..g.nb() {
            for ii in 0..g.mb() {
                g.set_elem(ii, jj, g.get(ii, jj) * factor);
            }
        }
    }
    Ok(())
}

/// Trapezoidal fill of every local tile of a view: `offdiag` off the
/// diagonal, `diag` on it, honouring the view's triangle.
pub(crate) fn set_local<T: Scalar>(offdiag: T, diag: T, a: &Matrix<T>) -> Result<()> {
    for (i, j) in a.local_tiles() {
        let keep = match a.uplo() {
            Uplo::General => true,
            Uplo::Lower => i >= j,
            Uplo::Upper => i <= j,
        };
        if !keep {
            continue;
        }
        let g = a.tile_get_for_writing(i, j, Layout::ColMajor)?;
        if i == j {
            g.set(offdiag, diag);
        } else {
            g.set(offdiag, offdiag);
        }
    }
    Ok(())
}

/// Scale local tiles by per-row and per-column factors
pub(crate) fn scale_row_col_local<T: Scalar>(r: &[f64], c: &[f64], a: &Matrix<T>) -> Result<()> {
    let mut row_off = 0usize;
    let mut row_offs = Vec::with_capacity(a.mt() as usize);
    for i in 0..a.mt() {
        row_offs.push(row_off);
        row_off += a.tile_mb(i) as usize;
    }
    let mut col_off = 0usize;
    let mut col_offs = Vec::with_capacity(a.nt() as usize);
    for j in 0..a.nt() {
        col_offs.push(col_off);
        col_off += a.tile_nb(j) as usize;
    }
    for (i, j) in a.local_tiles() {
        let g = a.tile_get_for_writing(i, j, Layout::ColMajor)?;
        let ro = row_offs[i as usize];
        let co = col_offs[j as usize];
        HostKernels::scale_row_col(
            &r[ro..ro + g.mb() as usize],
            &c[co..co + g.nb() as usize],
            &g.tile(),
        );
    }
    Ok(())
}
