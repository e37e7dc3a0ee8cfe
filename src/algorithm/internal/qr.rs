//! Panel factorization and triangle-triangle reduction
//!
//! The QR panel is factored per process row: each rank stacks its local
//! tiles of the panel column and runs a Householder QR in the nested
//! panel pool, leaving a local triangular R in its first tile. The
//! per-rank triangles are then merged pairwise up a binary tree
//! (`ttqrt`), and the matching applies (`unmqr` locally, `ttmqr` across
//! the tree) update trailing columns.

use crate::dtype::Scalar;
use crate::error::Result;
use crate::kernel::{HostKernels, TileKernels};
use crate::matrix::Matrix;
use crate::tile::{Layout, Op};
use crate::trace::TraceSpan;
use std::sync::Arc;

/// `(rank, first tile-row)` of every rank owning tiles of the panel
/// column, sorted by first tile-row.
pub(crate) fn first_indices<T: Scalar>(a_panel: &Matrix<T>) -> Vec<(usize, i64)> {
    let mut seen: Vec<(usize, i64)> = Vec::new();
    for i in 0..a_panel.mt() {
        let r = a_panel.tile_rank(i, 0);
        if !seen.iter().any(|(rank, _)| *rank == r) {
            seen.push((r, i));
        }
    }
    seen.sort_by_key(|(_, i)| *i);
    seen
}

/// Factor this rank's stacked rows of the panel column; the T factor
/// lands in `tl_panel` at the rank's first row.
pub(crate) fn geqrf_panel<T: Scalar>(
    a_panel: &Matrix<T>,
    tl_panel: &Matrix<T>,
    ib: i64,
    pool: &Arc<rayon::ThreadPool>,
) -> Result<()> {
    let mine: Vec<i64> = (0..a_panel.mt())
        .filter(|&i| a_panel.tile_is_local(i, 0))
        .collect();
    if mine.is_empty() {
        return Ok(());
    }
    let _span = TraceSpan::new("internal::geqrf_panel");

    let guards: Vec<_> = mine
        .iter()
        .map(|&i| a_panel.tile_get_for_writing(i, 0, Layout::ColMajor))
        .collect::<Result<_>>()?;
    let stack: Vec<_> = guards.iter().map(|g| g.tile()).collect();

    let t_guard = tl_panel.tile_get_for_overwrite(mine[0], 0, Layout::ColMajor)?;
    let t_tile = t_guard.tile();
    t_tile.set(T::zero(), T::zero());

    pool.install(|| HostKernels::geqrf(&stack, &t_tile, ib));
    Ok(())
}

/// Merge the per-rank panel triangles up a binary tree.
///
/// Pairs exchange over point-to-point messages: the upper partner ships
/// its R down, the lower partner factors `[R_top; R_own]`, keeps the
/// reflector block in its panel tile and the T factor in `tr_panel`,
/// and ships the merged R back.
pub(crate) fn ttqrt<T: Scalar>(
    a_panel: &Matrix<T>,
    tr_panel: &Matrix<T>,
    tag: u32,
) -> Result<()> {
    let fi = first_indices(a_panel);
    let nranks = fi.len();
    if nranks <= 1 {
        return Ok(());
    }
    let _span = TraceSpan::new("internal::ttqrt");
    let me = a_panel.rank();
    let nlevels = usize::BITS - (nranks - 1).leading_zeros();

    let mut step = 1usize;
    for _level in 0..nlevels {
        let mut index = 0;
        while index + step < nranks {
            let (top_rank, top_i) = fi[index];
            let (bot_rank, bot_i) = fi[index + step];

            if me == top_rank {
                // tree levels rewrite R in place
                a_panel.tile_get_for_writing(top_i, 0, Layout::ColMajor)?;
                a_panel.tile_send(top_i, 0, bot_rank, tag)?;
                a_panel.tile_recv(top_i, 0, bot_rank, Layout::ColMajor, tag)?;
            } else if me == bot_rank {
                a_panel.tile_recv(top_i, 0, top_rank, Layout::ColMajor, tag)?;
                {
                    let r1 = a_panel.tile_get_for_writing(top_i, 0, Layout::ColMajor)?;
                    let v = a_panel.tile_get_for_writing(bot_i, 0, Layout::ColMajor)?;
                    let t = tr_panel.tile_get_for_overwrite(bot_i, 0, Layout::ColMajor)?;
                    t.tile().set(T::zero(), T::zero());
                    HostKernels::ttqrt(&r1.tile(), &v.tile(), &t.tile());
                }
                a_panel.tile_send(top_i, 0, top_rank, tag)?;
            }
            index += 2 * step;
        }
        step *= 2;
    }
    Ok(())
}

/// Apply this rank's local panel reflectors to its tiles of `c`.
///
/// `c` must span the same tile rows as the panel; reflector tiles reach
/// non-owning ranks through the panel broadcast.
pub(crate) fn unmqr<T: Scalar>(
    op: Op,
    a_panel: &Matrix<T>,
    tl_panel: &Matrix<T>,
    c: &Matrix<T>,
) -> Result<()> {
    let _span = TraceSpan::new("internal::unmqr");
    for j in 0..c.nt() {
        let rows: Vec<i64> = (0..c.mt()).filter(|&i| c.tile_is_local(i, j)).collect();
        if rows.is_empty() {
            continue;
        }
        let v_guards: Vec<_> = rows
            .iter()
            .map(|&i| a_panel.tile_get_for_reading(i, 0, Layout::ColMajor))
            .collect::<Result<_>>()?;
        let v_stack: Vec<_> = v_guards.iter().map(|g| g.tile()).collect();
        let t_guard = tl_panel.tile_get_for_reading(rows[0], 0, Layout::ColMajor)?;

        let c_guards: Vec<_> = rows
            .iter()
            .map(|&i| c.tile_get_for_writing(i, j, Layout::ColMajor))
            .collect::<Result<_>>()?;
        let c_stack: Vec<_> = c_guards.iter().map(|g| g.tile()).collect();

        HostKernels::unmqr(op, &v_stack, &t_guard.tile(), &c_stack);
    }
    Ok(())
}

/// Apply the triangle-triangle reflectors to `c`, walking the reduction
/// tree in the order matching `op` (leaves-to-root for the factorization
/// direction, root-to-leaves for its inverse).
pub(crate) fn ttmqr<T: Scalar>(
    op: Op,
    a_panel: &Matrix<T>,
    tr_panel: &Matrix<T>,
    c: &Matrix<T>,
    tag: u32,
) -> Result<()> {
    let fi = first_indices(a_panel);
    let nranks = fi.len();
    if nranks <= 1 {
        return Ok(());
    }
    let _span = TraceSpan::new("internal::ttmqr");
    let me = c.rank();
    let nlevels = usize::BITS as usize - (nranks - 1).leading_zeros() as usize;

    let descend = op == Op::NoTrans;
    let mut step = if descend { 1 << (nlevels - 1) } else { 1 };

    for _level in 0..nlevels {
        let mut index = 0;
        while index < nranks {
            let bottom = index % (2 * step) != 0;
            let i = fi[index].1;

            // exchange: tops ship their C tiles down, bottoms receive
            for j in 0..c.nt() {
                if !c.tile_is_local(i, j) {
                    continue;
                }
                if !bottom {
                    if index + step < nranks {
                        let dst = c.tile_rank(fi[index + step].1, j);
                        c.tile_get_for_writing(i, j, Layout::ColMajor)?;
                        c.tile_send(i, j, dst, tag)?;
                    }
                } else {
                    let i1 = fi[index - step].1;
                    let src = c.tile_rank(i1, j);
                    c.tile_recv(i1, j, src, Layout::ColMajor, tag)?;
                }
            }

            // update: bottoms apply the pair reflectors
            if bottom {
                for j in 0..c.nt() {
                    if !c.tile_is_local(i, j) {
                        continue;
                    }
                    let i1 = fi[index - step].1;
                    let v = a_panel.tile_get_for_reading(i, 0, Layout::ColMajor)?;
                    let t = tr_panel.tile_get_for_reading(i, 0, Layout::ColMajor)?;
                    let c_top = c.tile_get_for_writing(i1, j, Layout::ColMajor)?;
                    let c_bot = c.tile_get_for_writing(i, j, Layout::ColMajor)?;
                    HostKernels::ttmqr(op, &v.tile(), &t.tile(), &c_top.tile(), &c_bot.tile());
                }
            }

            // return: updated top tiles travel back up
            for j in 0..c.nt() {
                if !c.tile_is_local(i, j) {
                    continue;
                }
                if !bottom {
                    if index + step < nranks {
                        let dst = c.tile_rank(fi[index + step].1, j);
                        c.tile_recv(i, j, dst, Layout::ColMajor, tag)?;
                    }
                } else {
                    let i1 = fi[index - step].1;
                    let peer = c.tile_rank(i1, j);
                    c.tile_send(i1, j, peer, tag)?;
                }
            }
            index += step;
        }
        if descend {
            step /= 2;
        } else {
            step *= 2;
        }
    }
    Ok(())
}
