//! Cholesky factorization and solves (full and band)

use super::internal::{self, TileOp};
use super::trsm::tbsm;
use super::{driver_scheduler, DriverTags};
use crate::comm::salt;
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::kernel::{HostKernels, Side, TileKernels};
use crate::matrix::{HermitianBandMatrix, HermitianMatrix, Matrix, TriangularMatrix};
use crate::options::Options;
use crate::schedule::Dep;
use crate::tile::{Diag, Layout, Uplo};

fn lower_view<T: Scalar>(a: &HermitianMatrix<T>) -> Result<HermitianMatrix<T>> {
    match a.uplo() {
        Uplo::Lower => Ok(a.clone()),
        Uplo::Upper => HermitianMatrix::new(Uplo::Lower, &a.as_general().conj_transpose()),
        Uplo::General => Err(Error::invalid_arg("a", "hermitian view required")),
    }
}

/// Right-looking Cholesky factorization `A = L L^H` with lookahead.
///
/// On success the lower triangle holds `L`. A non-positive pivot is
/// reported as `Numerical { info }` with the 1-based global index; the
/// factorization stops there.
pub fn potrf<T: Scalar>(a: &HermitianMatrix<T>, opts: &Options) -> Result<()> {
    let a = lower_view(a)?;
    let mt = a.mt();
    let lookahead = opts.lookahead.max(0);
    a.devices().set_num_queues(3 + lookahead as usize);

    let sched = driver_scheduler(opts)?;
    let group = sched.group();
    let tags = DriverTags::reserve(a.tags(), salt::BCAST, (mt * (mt + 1)) as u32)?;

    // global element offset of each tile row, for info reporting
    let mut row_offs = vec![0i64; mt as usize + 1];
    for i in 0..mt {
        row_offs[i as usize + 1] = row_offs[i as usize] + a.tile_mb(i);
    }

    for k in 0..mt {
        let a_k = a.as_general().clone();
        let tags_k = tags.clone();
        let info_base = row_offs[k as usize];
        group.spawn(&[Dep::InOut(k as usize)], 1, move || {
            // factor the diagonal tile
            if a_k.tile_is_local(k, k) {
                let d = a_k.tile_get_for_writing(k, k, Layout::ColMajor)?;
                let d_tile = d.tile().with_uplo(Uplo::Lower, Diag::NonUnit);
                let info = HostKernels::potrf(&d_tile);
                if info != 0 {
                    return Err(Error::Numerical {
                        info: info_base + info,
                    });
                }
            }
            let mut list = Vec::new();
            if k + 1 < mt {
                // diagonal tile feeds the panel solves below it
                list.push((k, k, vec![a_k.sub(k + 1, mt - 1, k, k)]));
            }
            a_k.list_bcast(&list, Layout::ColMajor, &tags_k, (k * (mt + 1)) as u32)?;

            // panel: A(i, k) := A(i, k) * L(k, k)^-H
            for i in k + 1..mt {
                if a_k.tile_is_local(i, k) {
                    let d = a_k.tile_get_for_reading(k, k, Layout::ColMajor)?;
                    let l = d.tile().with_uplo(Uplo::Lower, Diag::NonUnit).conj_transpose();
                    let p = a_k.tile_get_for_writing(i, k, Layout::ColMajor)?;
                    HostKernels::trsm(Side::Right, T::one(), &l, &p.tile());
                }
            }

            // panel tiles feed their row to the left and column below
            let mut list = Vec::new();
            for i in k + 1..mt {
                let mut views = vec![a_k.sub(i, i, k + 1, i)];
                if i + 1 < mt {
                    views.push(a_k.sub(i, mt - 1, i, i));
                }
                list.push((i, k, views));
            }
            a_k.list_bcast(&list, Layout::ColMajor, &tags_k, (k * (mt + 1) + 1) as u32)
        });

        let update = |j: i64| {
            let a_k = a.as_general().clone();
            let ah_k = a.as_general().conj_transpose();
            let target = opts.target;
            move || {
                let ops: Vec<TileOp<T>> = (j..a_k.mt())
                    .filter(|&i| a_k.tile_is_local(i, j))
                    .map(|i| TileOp {
                        alpha: T::zero() - T::one(),
                        beta: T::one(),
                        a: (a_k.clone(), i, k),
                        b: (ah_k.clone(), k, j),
                        c: (a_k.clone(), i, j),
                        herk: i == j,
                    })
                    .collect();
                internal::run_tile_ops(target, ops, (j - k) as usize)
            }
        };

        for j in k + 1..(k + 1 + lookahead).min(mt) {
            group.spawn(
                &[Dep::In(k as usize), Dep::InOut(j as usize)],
                1,
                update(j),
            );
        }
        if k + 1 + lookahead < mt {
            let body: Vec<i64> = (k + 1 + lookahead..mt).collect();
            let deps = vec![
                Dep::In(k as usize),
                Dep::InOut((k + 1 + lookahead) as usize),
                Dep::InOut((mt - 1) as usize),
            ];
            let updates: Vec<_> = body.iter().map(|&j| update(j)).collect();
            group.spawn(&deps, 0, move || {
                for u in updates {
                    u()?;
                }
                Ok(())
            });
        }

        // release the finished column
        let a_k = a.as_general().clone();
        group.spawn(&[Dep::InOut(k as usize)], 0, move || {
            for i in 0..a_k.mt() {
                if a_k.tile_is_local(i, k) {
                    a_k.tile_update_origin(i, k)?;
                    a_k.release_local_workspace_tile(i, k)?;
                } else {
                    a_k.release_remote_workspace_tile(i, k)?;
                }
            }
            Ok(())
        });
    }

    group.wait()?;
    a.tile_update_all_origin()?;
    a.release_workspace()
}

/// Solve `A X = B` from a `potrf` factorization: two triangular solves.
pub fn potrs<T: Scalar>(a: &HermitianMatrix<T>, b: &Matrix<T>, opts: &Options) -> Result<()> {
    let a = lower_view(a)?;
    let l = TriangularMatrix::new(Uplo::Lower, Diag::NonUnit, a.as_general())?;
    super::trsm::trsm(Side::Left, T::one(), &l, b, opts)?;
    super::trsm::trsm(Side::Left, T::one(), &l.conj_transpose(), b, opts)
}

/// Band Cholesky factorization: `potrf` restricted to the stored band.
pub fn pbtrf<T: Scalar>(a: &HermitianBandMatrix<T>, opts: &Options) -> Result<()> {
    if a.uplo() != Uplo::Lower {
        return Err(Error::invalid_arg("a", "lower storage required"));
    }
    let g = a.as_general().clone();
    let mt = g.mt();
    let sched = driver_scheduler(opts)?;
    let group = sched.group();
    let tags = DriverTags::reserve(g.tags(), salt::BCAST, (mt * (mt + 1)) as u32)?;

    let mut row_offs = vec![0i64; mt as usize + 1];
    for i in 0..mt {
        row_offs[i as usize + 1] = row_offs[i as usize] + g.tile_mb(i);
    }

    for k in 0..mt {
        // rows of the band below the diagonal tile
        let reach: Vec<i64> = (k + 1..mt).filter(|&i| a.tile_in_band(i, k)).collect();
        let hi = reach.last().copied().unwrap_or(k);

        let g_k = g.clone();
        let gh_k = g.conj_transpose();
        let tags_k = tags.clone();
        let reach_k = reach.clone();
        let info_base = row_offs[k as usize];
        let target = opts.target;
        let deps: Vec<Dep> = (k..=hi).map(|c| Dep::InOut(c as usize)).collect();
        group.spawn(&deps, 0, move || {
            if g_k.tile_is_local(k, k) {
                let d = g_k.tile_get_for_writing(k, k, Layout::ColMajor)?;
                let info = HostKernels::potrf(&d.tile().with_uplo(Uplo::Lower, Diag::NonUnit));
                if info != 0 {
                    return Err(Error::Numerical {
                        info: info_base + info,
                    });
                }
            }
            let mut list = Vec::new();
            if !reach_k.is_empty() {
                list.push((k, k, vec![g_k.sub(reach_k[0], hi, k, k)]));
            }
            g_k.list_bcast(&list, Layout::ColMajor, &tags_k, (k * (mt + 1)) as u32)?;

            for &i in &reach_k {
                if g_k.tile_is_local(i, k) {
                    let d = g_k.tile_get_for_reading(k, k, Layout::ColMajor)?;
                    let l = d.tile().with_uplo(Uplo::Lower, Diag::NonUnit).conj_transpose();
                    let p = g_k.tile_get_for_writing(i, k, Layout::ColMajor)?;
                    HostKernels::trsm(Side::Right, T::one(), &l, &p.tile());
                }
            }
            let mut list = Vec::new();
            for &i in &reach_k {
                let mut views = vec![g_k.sub(i, i, k + 1, i)];
                if i < hi {
                    views.push(g_k.sub(i, hi, i, i));
                }
                list.push((i, k, views));
            }
            g_k.list_bcast(&list, Layout::ColMajor, &tags_k, (k * (mt + 1) + 1) as u32)?;

            let mut ops = Vec::new();
            for &j in &reach_k {
                for i in j..=hi {
                    if g_k.tile_is_local(i, j) {
                        ops.push(TileOp {
                            alpha: T::zero() - T::one(),
                            beta: T::one(),
                            a: (g_k.clone(), i, k),
                            b: (gh_k.clone(), k, j),
                            c: (g_k.clone(), i, j),
                            herk: i == j,
                        });
                    }
                }
            }
            internal::run_tile_ops(target, ops, 0)
        });
    }

    group.wait()?;
    g.tile_update_all_origin()?;
    g.release_workspace()
}

/// Band Cholesky solve: `A X = B` with `A = L L^H` from `pbtrf`.
pub fn pbtrs<T: Scalar>(
    a: &HermitianBandMatrix<T>,
    b: &Matrix<T>,
    opts: &Options,
) -> Result<()> {
    if a.uplo() != Uplo::Lower {
        return Err(Error::invalid_arg("a", "lower storage required"));
    }
    let l = a.triangular(Diag::NonUnit);
    tbsm(T::one(), &l, b, opts)?;
    tbsm(T::one(), &l.conj_transpose(), b, opts)
}
