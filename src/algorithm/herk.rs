//! Hermitian rank-k update driver

use super::internal::{self, TileOp};
use super::{driver_scheduler, DriverTags};
use crate::comm::salt;
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::matrix::HermitianMatrix;
use crate::matrix::Matrix;
use crate::options::Options;
use crate::schedule::Dep;
use crate::tile::{Layout, Uplo};

/// `C := alpha * A * A^H + beta * C` on the stored (lower) triangle.
pub fn herk<T: Scalar>(
    alpha: f64,
    a: &Matrix<T>,
    beta: f64,
    c: &HermitianMatrix<T>,
    opts: &Options,
) -> Result<()> {
    if c.uplo() != Uplo::Lower {
        return Err(Error::invalid_arg("c", "lower storage required"));
    }
    if a.mt() != c.mt() {
        return Err(Error::invalid_arg("a", "row tiles must match the update target"));
    }

    let sched = driver_scheduler(opts)?;
    let group = sched.group();
    let (mt, kt) = (c.mt(), a.nt());
    let tags = DriverTags::reserve(a.tags(), salt::BCAST, (kt * mt) as u32)?;

    for j in 0..mt {
        let c = c.as_general().clone();
        group.spawn(&[Dep::InOut(j as usize)], 0, move || {
            internal::scale_col_local(T::from_real(beta), &c, j, true)
        });
    }

    let comm_slot = |k: i64| (mt + k) as usize;
    for k in 0..kt {
        let (a_k, c_k) = (a.clone(), c.as_general().clone());
        let tags_k = tags.clone();
        group.spawn(&[Dep::Out(comm_slot(k))], 1, move || {
            // A(i, k) feeds row i to its left and column i below
            let list = (0..mt)
                .map(|i| {
                    let mut views = vec![c_k.sub(i, i, 0, i)];
                    if i + 1 < mt {
                        views.push(c_k.sub(i, mt - 1, i, i));
                    }
                    (i, k, views)
                })
                .collect();
            a_k.list_bcast(&list, Layout::ColMajor, &tags_k, (k * mt) as u32)
        });

        for j in 0..mt {
            let (a_k, c_k) = (a.clone(), c.as_general().clone());
            let ah_k = a.conj_transpose();
            let target = opts.target;
            group.spawn(
                &[Dep::In(comm_slot(k)), Dep::InOut(j as usize)],
                0,
                move || {
                    let ops: Vec<TileOp<T>> = (j..c_k.mt())
                        .filter(|&i| c_k.tile_is_local(i, j))
                        .map(|i| TileOp {
                            alpha: T::from_real(alpha),
                            beta: T::one(),
                            a: (a_k.clone(), i, k),
                            b: (ah_k.clone(), k, j),
                            c: (c_k.clone(), i, j),
                            herk: i == j,
                        })
                        .collect();
                    internal::run_tile_ops(target, ops, j as usize)
                },
            );
        }
    }

    group.wait()?;
    c.tile_update_all_origin()?;
    a.release_workspace()?;
    c.release_workspace()
}
