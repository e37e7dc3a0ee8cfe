//! Triangular solve drivers (full and band)

use super::internal::{self, TileOp};
use super::{driver_scheduler, DriverTags};
use crate::comm::salt;
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::kernel::{HostKernels, Side, TileKernels};
use crate::matrix::{Matrix, TriangularBandMatrix, TriangularMatrix};
use crate::options::Options;
use crate::schedule::Dep;
use crate::tile::{Layout, Uplo};

/// Solve `op(A) X = alpha B` (Left) or `X op(A) = alpha B` (Right) with
/// a triangular `A`; `X` overwrites `B`.
pub fn trsm<T: Scalar>(
    side: Side,
    alpha: T,
    a: &TriangularMatrix<T>,
    b: &Matrix<T>,
    opts: &Options,
) -> Result<()> {
    match side {
        Side::Left => solve_left(a.as_general(), None, alpha, b, opts),
        Side::Right => {
            // X op(A) = B  <=>  op(A)^T X^T = B^T, sharing storage
            let at = TriangularMatrix::new(a.uplo().flipped(), a.diag(), &a.transpose())?;
            solve_left(at.as_general(), None, alpha, &b.transpose(), opts)
        }
    }
}

/// Band triangular solve: `op(A) X = alpha B` with a triangular band
/// `A`; updates stay inside the band.
pub fn tbsm<T: Scalar>(
    alpha: T,
    a: &TriangularBandMatrix<T>,
    b: &Matrix<T>,
    opts: &Options,
) -> Result<()> {
    solve_left(a, Some(a.kd()), alpha, b, opts)
}

/// Shared left-solve sweep. `a` carries its triangle through the view's
/// uplo; `band` bounds the update reach below (or above) the diagonal.
fn solve_left<T: Scalar>(
    a: &Matrix<T>,
    band: Option<i64>,
    alpha: T,
    b: &Matrix<T>,
    opts: &Options,
) -> Result<()> {
    if a.mt() != b.mt() || a.m() != b.m() {
        return Err(Error::invalid_arg("b", "row extent must match the triangle"));
    }
    let forward = a.uplo() == Uplo::Lower;
    let (mt, nt) = (b.mt(), b.nt());

    let sched = driver_scheduler(opts)?;
    let group = sched.group();
    let a_tags = DriverTags::reserve(a.tags(), salt::TRSM, (mt * mt) as u32)?;
    let b_tags = DriverTags::reserve(b.tags(), salt::TRSM_B, (mt * nt) as u32)?;

    for j in 0..nt {
        let b = b.clone();
        group.spawn(&[Dep::InOut(j as usize)], 0, move || {
            internal::scale_col_local(alpha, &b, j, false)
        });
    }

    let in_reach = move |a: &Matrix<T>, i: i64, k: i64| match band {
        None => true,
        // the i-range already picks the solve direction; a symmetric
        // bound covers both triangles
        Some(kd) => crate::matrix::tile_in_band(a, i, k, kd, kd),
    };

    let steps: Vec<i64> = if forward {
        (0..mt).collect()
    } else {
        (0..mt).rev().collect()
    };
    let comm_slot = |k: i64| (nt + k) as usize;

    for &k in &steps {
        // rows the step-k update reaches
        let reach: Vec<i64> = if forward {
            (k + 1..mt).filter(|&i| in_reach(a, i, k)).collect()
        } else {
            (0..k).filter(|&i| in_reach(a, i, k)).collect()
        };

        let (a_k, b_k) = (a.clone(), b.clone());
        let tags_k = a_tags.clone();
        let reach_c = reach.clone();
        group.spawn(&[Dep::Out(comm_slot(k))], 1, move || {
            let mut list = vec![(k, k, vec![b_k.sub(k, k, 0, nt - 1)])];
            for &i in &reach_c {
                list.push((i, k, vec![b_k.sub(i, i, 0, nt - 1)]));
            }
            a_k.list_bcast(&list, Layout::ColMajor, &tags_k, (k * mt) as u32)
        });

        for j in 0..nt {
            let (a_k, b_k) = (a.clone(), b.clone());
            let b_tags_k = b_tags.clone();
            let reach_t = reach.clone();
            let target = opts.target;
            group.spawn(
                &[Dep::In(comm_slot(k)), Dep::InOut(j as usize)],
                0,
                move || {
                    // solve the diagonal block row
                    if b_k.tile_is_local(k, j) {
                        let akk = a_k.tile_get_for_reading(k, k, Layout::ColMajor)?;
                        let bkj = b_k.tile_get_for_writing(k, j, Layout::ColMajor)?;
                        HostKernels::trsm(Side::Left, T::one(), &akk.tile(), &bkj.tile());
                    }
                    // hand the solved row down (or up) its column
                    if !reach_t.is_empty() {
                        let lo = *reach_t.iter().min().unwrap();
                        let hi = *reach_t.iter().max().unwrap();
                        let list = vec![(k, j, vec![b_k.sub(lo, hi, j, j)])];
                        b_k.list_bcast(&list, Layout::ColMajor, &b_tags_k, (k * nt + j) as u32)?;
                    }
                    let ops: Vec<TileOp<T>> = reach_t
                        .iter()
                        .filter(|&&i| b_k.tile_is_local(i, j))
                        .map(|&i| TileOp {
                            alpha: T::zero() - T::one(),
                            beta: T::one(),
                            a: (a_k.clone(), i, k),
                            b: (b_k.clone(), k, j),
                            c: (b_k.clone(), i, j),
                            herk: false,
                        })
                        .collect();
                    internal::run_tile_ops(target, ops, j as usize)
                },
            );
        }
    }

    group.wait()?;
    b.tile_update_all_origin()?;
    a.release_workspace()?;
    b.release_workspace()
}
