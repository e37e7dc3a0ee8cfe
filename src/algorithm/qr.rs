//! QR factorization (triangle-triangle reduction) and Q application

use super::internal::qr as ttqr;
use super::{driver_scheduler, DriverTags};
use crate::comm::salt;
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::kernel::Side;
use crate::matrix::{Matrix, TriangularFactors};
use crate::options::Options;
use crate::schedule::Dep;
use crate::tile::{Layout, Op};

/// Distributed QR factorization `A = Q R` with lookahead.
///
/// Each process row factors its stacked panel rows locally; the per-row
/// triangles merge up a binary reduction tree. On exit the upper
/// trapezoid of `A` holds `R`, the lower part holds the local
/// reflectors, and `t` holds the `Tlocal`/`Treduce` block-reflector
/// factors consumed by [`unmqr`].
pub fn geqrf<T: Scalar>(
    a: &Matrix<T>,
    t: &mut TriangularFactors<T>,
    opts: &Options,
) -> Result<()> {
    let (mt, nt) = (a.mt(), a.nt());
    let steps = mt.min(nt);
    let lookahead = opts.lookahead.max(0);
    let ib = opts.inner_blocking.max(1);
    a.devices().set_num_queues(3 + lookahead as usize);

    let sched = driver_scheduler(opts)?;
    let group = sched.group();

    let v_tags = DriverTags::reserve(a.tags(), salt::BCAST, (steps * mt) as u32)?;
    let tl_tags = DriverTags::reserve(t.local.tags(), salt::TT, (steps * mt) as u32)?;
    let tr_tags = DriverTags::reserve(t.reduce.tags(), salt::REDUCE, (steps * mt) as u32)?;
    let qrt_tags = DriverTags::reserve(a.tags(), salt::TTQRT, steps as u32)?;
    let mqr_tags = DriverTags::reserve(a.tags(), salt::TTMQR, (steps * nt) as u32)?;

    for k in 0..steps {
        let a_panel = a.sub(k, mt - 1, k, k);
        let tl_panel = t.local.sub(k, mt - 1, k, k);
        let tr_panel = t.reduce.sub(k, mt - 1, k, k);
        let first = ttqr::first_indices(&a_panel);

        // panel: local factorization, triangle merge, reflector bcasts
        {
            let (a_k, tl_k, tr_k) = (a.clone(), t.local.clone(), t.reduce.clone());
            let (a_panel, tl_panel, tr_panel) =
                (a_panel.clone(), tl_panel.clone(), tr_panel.clone());
            let first = first.clone();
            let (v_tags, tl_tags, tr_tags, qrt_tags) = (
                v_tags.clone(),
                tl_tags.clone(),
                tr_tags.clone(),
                qrt_tags.clone(),
            );
            let pool = sched.panel_pool().clone();
            group.spawn(&[Dep::InOut(k as usize)], 1, move || {
                ttqr::geqrf_panel(&a_panel, &tl_panel, ib, &pool)?;
                ttqr::ttqrt(&a_panel, &tr_panel, qrt_tags.tag(k as u32))?;

                if k < nt - 1 {
                    // reflectors travel right across their rows
                    let list = (k..mt)
                        .map(|i| (i, k, vec![a_k.sub(i, i, k + 1, nt - 1)]))
                        .collect();
                    a_k.list_bcast(&list, Layout::ColMajor, &v_tags, (k * mt) as u32)?;

                    // first_indices are panel-relative; shift to matrix rows
                    let list = first
                        .iter()
                        .map(|&(_, row)| {
                            (row + k, k, vec![tl_k.sub(row + k, row + k, k + 1, nt - 1)])
                        })
                        .collect();
                    tl_k.list_bcast(&list, Layout::ColMajor, &tl_tags, (k * mt) as u32)?;

                    // the reduction root carries no Treduce tile
                    let list = first
                        .iter()
                        .filter(|&&(_, row)| row > 0)
                        .map(|&(_, row)| {
                            (row + k, k, vec![tr_k.sub(row + k, row + k, k + 1, nt - 1)])
                        })
                        .collect();
                    tr_k.list_bcast(&list, Layout::ColMajor, &tr_tags, (k * mt) as u32)?;
                }
                Ok(())
            });
        }

        let apply = |j_first: i64, j_last: i64, tag: u32| {
            let a_k = a.clone();
            let (a_panel, tl_panel, tr_panel) =
                (a_panel.clone(), tl_panel.clone(), tr_panel.clone());
            move || {
                let c = a_k.sub(k, a_k.mt() - 1, j_first, j_last);
                ttqr::unmqr(Op::ConjTrans, &a_panel, &tl_panel, &c)?;
                ttqr::ttmqr(Op::ConjTrans, &a_panel, &tr_panel, &c, tag)
            }
        };

        for j in k + 1..(k + 1 + lookahead).min(nt) {
            group.spawn(
                &[Dep::In(k as usize), Dep::InOut(j as usize)],
                1,
                apply(j, j, mqr_tags.tag((k * nt + j) as u32)),
            );
        }
        if k + 1 + lookahead < nt {
            let j = k + 1 + lookahead;
            group.spawn(
                &[
                    Dep::In(k as usize),
                    Dep::InOut(j as usize),
                    Dep::InOut((nt - 1) as usize),
                ],
                0,
                apply(j, nt - 1, mqr_tags.tag((k * nt + j) as u32)),
            );
        }

        // retire the finished column
        {
            let (a_k, tl_k, tr_k) = (a.clone(), t.local.clone(), t.reduce.clone());
            let first = first.clone();
            group.spawn(&[Dep::InOut(k as usize)], 0, move || {
                for i in 0..a_k.mt() {
                    if a_k.tile_is_local(i, k) {
                        a_k.tile_update_origin(i, k)?;
                        a_k.release_local_workspace_tile(i, k)?;
                    } else {
                        a_k.release_remote_workspace_tile(i, k)?;
                    }
                }
                for &(_, row) in &first {
                    let row = row + k; // panel rows are relative to k
                    if tl_k.tile_is_local(row, k) {
                        tl_k.tile_update_origin(row, k)?;
                        tl_k.release_local_workspace_tile(row, k)?;
                        if row != k {
                            tr_k.tile_update_origin(row, k)?;
                            tr_k.release_local_workspace_tile(row, k)?;
                        }
                    } else {
                        tl_k.release_remote_workspace_tile(row, k)?;
                        tr_k.release_remote_workspace_tile(row, k)?;
                    }
                }
                Ok(())
            });
        }
    }

    group.wait()?;
    a.tile_update_all_origin()?;
    t.local.tile_update_all_origin()?;
    t.reduce.tile_update_all_origin()?;
    a.release_workspace()?;
    t.local.release_workspace()?;
    t.reduce.release_workspace()
}

/// Apply `Q` (or `Q^H`) from a `geqrf` factorization to `C` from the
/// left.
pub fn unmqr<T: Scalar>(
    side: Side,
    op: Op,
    a: &Matrix<T>,
    t: &TriangularFactors<T>,
    c: &Matrix<T>,
    opts: &Options,
) -> Result<()> {
    if side != Side::Left {
        return Err(Error::NotImplemented {
            feature: "right-side Q application",
        });
    }
    if op == Op::Trans {
        return Err(Error::invalid_arg("op", "NoTrans or ConjTrans required"));
    }
    if c.mt() != a.mt() {
        return Err(Error::invalid_arg("c", "row tiles must match the factorization"));
    }
    let (mt, nt) = (a.mt(), a.nt());
    let steps = mt.min(nt);
    let cnt = c.nt();

    let sched = driver_scheduler(opts)?;
    let group = sched.group();

    let v_tags = DriverTags::reserve(a.tags(), salt::BCAST, (steps * mt) as u32)?;
    let tl_tags = DriverTags::reserve(t.local.tags(), salt::TT, (steps * mt) as u32)?;
    let tr_tags = DriverTags::reserve(t.reduce.tags(), salt::REDUCE, (steps * mt) as u32)?;
    let mqr_tags = DriverTags::reserve(c.tags(), salt::TTMQR, steps as u32)?;

    let ks: Vec<i64> = if op == Op::ConjTrans {
        (0..steps).collect()
    } else {
        (0..steps).rev().collect()
    };

    for &k in &ks {
        let a_panel = a.sub(k, mt - 1, k, k);
        let tl_panel = t.local.sub(k, mt - 1, k, k);
        let tr_panel = t.reduce.sub(k, mt - 1, k, k);
        let first = ttqr::first_indices(&a_panel);

        let (a_k, tl_k, tr_k, c_k) = (a.clone(), t.local.clone(), t.reduce.clone(), c.clone());
        let (v_tags, tl_tags, tr_tags, mqr_tags) = (
            v_tags.clone(),
            tl_tags.clone(),
            tr_tags.clone(),
            mqr_tags.clone(),
        );
        // one chain: Q applications reuse the factorization's panels in
        // strict step order
        group.spawn(&[Dep::InOut(0)], 0, move || {
            let list = (k..mt)
                .map(|i| (i, k, vec![c_k.sub(i, i, 0, cnt - 1)]))
                .collect();
            a_k.list_bcast(&list, Layout::ColMajor, &v_tags, (k * mt) as u32)?;

            let list = first
                .iter()
                .map(|&(_, row)| (row + k, k, vec![c_k.sub(row + k, row + k, 0, cnt - 1)]))
                .collect();
            tl_k.list_bcast(&list, Layout::ColMajor, &tl_tags, (k * mt) as u32)?;

            let list = first
                .iter()
                .filter(|&&(_, row)| row > 0)
                .map(|&(_, row)| (row + k, k, vec![c_k.sub(row + k, row + k, 0, cnt - 1)]))
                .collect();
            tr_k.list_bcast(&list, Layout::ColMajor, &tr_tags, (k * mt) as u32)?;

            let c_below = c_k.sub(k, c_k.mt() - 1, 0, cnt - 1);
            let tag = mqr_tags.tag(k as u32);
            if op == Op::ConjTrans {
                ttqr::unmqr(op, &a_panel, &tl_panel, &c_below)?;
                ttqr::ttmqr(op, &a_panel, &tr_panel, &c_below, tag)
            } else {
                ttqr::ttmqr(op, &a_panel, &tr_panel, &c_below, tag)?;
                ttqr::unmqr(op, &a_panel, &tl_panel, &c_below)
            }
        });
    }

    group.wait()?;
    c.tile_update_all_origin()?;
    a.release_workspace()?;
    t.local.release_workspace()?;
    t.reduce.release_workspace()?;
    c.release_workspace()
}
