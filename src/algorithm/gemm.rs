//! General matrix-matrix multiply driver

use super::internal::{self, TileOp};
use super::{driver_scheduler, DriverTags};
use crate::comm::salt;
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::options::Options;
use crate::schedule::Dep;
use crate::tile::Layout;

/// `C := alpha * op(A) * op(B) + beta * C`, tiles of `A` and `B`
/// broadcast to the ranks whose `C` tiles they update, one update task
/// per block-column of `C`.
pub fn gemm<T: Scalar>(
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    beta: T,
    c: &Matrix<T>,
    opts: &Options,
) -> Result<()> {
    if a.mt() != c.mt() || b.nt() != c.nt() || a.nt() != b.mt() {
        return Err(Error::invalid_arg(
            "a/b/c",
            format!(
                "tile extents do not chain: ({}x{}) * ({}x{}) -> ({}x{})",
                a.mt(),
                a.nt(),
                b.mt(),
                b.nt(),
                c.mt(),
                c.nt()
            ),
        ));
    }

    let sched = driver_scheduler(opts)?;
    let group = sched.group();
    let kt = a.nt();
    let (mt, nt) = (c.mt(), c.nt());

    let a_tags = DriverTags::reserve(a.tags(), salt::BCAST, (kt * mt) as u32)?;
    let b_tags = DriverTags::reserve(b.tags(), salt::TRSM_B, (kt * nt) as u32)?;

    // beta pass, one task per block-column
    for j in 0..nt {
        let c = c.clone();
        group.spawn(&[Dep::InOut(j as usize)], 0, move || {
            internal::scale_col_local(beta, &c, j, false)
        });
    }

    let comm_slot = |k: i64| (nt + k) as usize;
    for k in 0..kt {
        let (a_k, b_k, c_k) = (a.clone(), b.clone(), c.clone());
        let (a_tags_k, b_tags_k) = (a_tags.clone(), b_tags.clone());
        group.spawn(&[Dep::Out(comm_slot(k))], 1, move || {
            let list_a = (0..mt)
                .map(|i| (i, k, vec![c_k.sub(i, i, 0, nt - 1)]))
                .collect();
            a_k.list_bcast(&list_a, Layout::ColMajor, &a_tags_k, (k * mt) as u32)?;
            let list_b = (0..nt)
                .map(|j| (k, j, vec![c_k.sub(0, mt - 1, j, j)]))
                .collect();
            b_k.list_bcast(&list_b, Layout::ColMajor, &b_tags_k, (k * nt) as u32)?;
            Ok(())
        });

        for j in 0..nt {
            let (a_k, b_k, c_k) = (a.clone(), b.clone(), c.clone());
            let target = opts.target;
            group.spawn(
                &[Dep::In(comm_slot(k)), Dep::InOut(j as usize)],
                0,
                move || {
                    let ops: Vec<TileOp<T>> = (0..mt)
                        .filter(|&i| c_k.tile_is_local(i, j))
                        .map(|i| TileOp {
                            alpha,
                            beta: T::one(),
                            a: (a_k.clone(), i, k),
                            b: (b_k.clone(), k, j),
                            c: (c_k.clone(), i, j),
                            herk: false,
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
    b.release_workspace()?;
    c.release_workspace()
}
