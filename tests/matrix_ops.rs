//! Matrix construction scenarios: non-uniform tiles, ScaLAPACK wrapping

mod common;

use common::mesh_run;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tilr::device::DeviceRegistry;
use tilr::matrix::MatrixStorage;
use tilr::prelude::*;

#[test]
fn test_non_uniform_tiles_on_mesh() {
    // 1000 x 1000 r32 matrix, alternating full/half column tiles on a
    // 2 x 2 grid, filled per rank from a seeded generator
    let (n, nb, p, q) = (1000i64, 256i64, 2usize, 2usize);
    mesh_run(p * q, move |transport| {
        let rank = transport.rank();
        let a: Matrix<f32> = Matrix::with_tile_fns(
            n,
            n,
            Arc::new(move |_| nb),
            Arc::new(move |j| if j % 2 != 0 { nb / 2 } else { nb }),
            (p, q),
            MatrixStorage::<f32>::block_cyclic_owner(p, q),
            Arc::new(|_, _| 0),
            transport,
            Arc::new(DeviceRegistry::host_only()),
        )
        .unwrap();
        a.insert_local_tiles().unwrap();

        let mut rng = StdRng::seed_from_u64(100 * rank as u64);
        for (i, j) in a.local_tiles() {
            let g = a.tile_get_for_writing(i, j, Layout::ColMajor).unwrap();
            for jj in 0..g.nb() {
                for ii in 0..g.mb() {
                    g.set_elem(ii, jj, rng.gen_range(-1.0f32..1.0));
                }
            }
        }

        // column extents clamp at the edge and sum exactly to n
        let mut total = 0i64;
        for j in 0..a.nt() {
            let proposed = if j % 2 != 0 { nb / 2 } else { nb };
            assert_eq!(a.tile_nb(j), proposed.min(n - total));
            total += a.tile_nb(j);
        }
        assert_eq!(total, 1000);

        // per-rank tile count has a closed form on the cyclic grid
        let my_rows = (0..a.mt()).filter(|i| *i as usize % p == rank % p).count();
        let my_cols = (0..a.nt()).filter(|j| *j as usize % q == rank / p).count();
        assert_eq!(a.local_tiles().len(), my_rows * my_cols);
    });
}

#[test]
fn test_scalapack_wrap_on_mesh() {
    // each rank wraps its local block-cyclic panel; origin tiles point
    // into the user buffer and writes land there after origin update
    let (m, n, nb, p, q) = (64i64, 64i64, 16i64, 2usize, 2usize);
    mesh_run(p * q, move |transport| {
        let rank = transport.rank();
        // 2 block rows x 2 block cols locally
        let lld = m / p as i64;
        let mut buf = vec![0.0f64; (lld * n / q as i64) as usize];
        for (at, v) in buf.iter_mut().enumerate() {
            *v = (rank * 10_000 + at) as f64;
        }

        let a = unsafe {
            Matrix::from_scalapack(m, n, buf.as_mut_ptr(), lld, nb, p, q, transport.clone())
                .unwrap()
        };

        // tile (1, 1) lives on rank (1 + 1*2) = 3; its first element is
        // local block (0, 0) offset nothing for that rank
        let owner = (1 % p) + (1 % q) * p;
        if rank == owner {
            let g = a.tile(1, 1).unwrap();
            assert_eq!(g.get(0, 0), (rank * 10_000) as f64);
        }

        // a write through the engine reaches the user buffer
        for (i, j) in a.local_tiles() {
            let g = a.tile_get_for_writing(i, j, Layout::ColMajor).unwrap();
            g.set_elem(0, 0, -1.0);
        }
        a.tile_update_all_origin().unwrap();
        assert_eq!(buf[0], -1.0);
        transport.barrier().unwrap();
    });
}

#[test]
fn test_band_views_restrict_iteration() {
    let a: Matrix<f64> = Matrix::new(96, 96, 16, 1, 1, ChannelTransport::solo()).unwrap();
    a.insert_local_tiles().unwrap();

    let hb = HermitianBandMatrix::new(Uplo::Lower, 16, &a).unwrap();
    let in_band: Vec<(i64, i64)> = a
        .tiles()
        .into_iter()
        .filter(|&(i, j)| j <= i && hb.tile_in_band(i, j))
        .collect();
    // diagonal plus one sub-diagonal of tiles
    assert_eq!(in_band.len(), (6 + 5) as usize);

    let lt = hb.triangular(Diag::NonUnit).conj_transpose();
    assert_eq!(lt.uplo(), Uplo::Upper);
    assert!(lt.tile_in_band(0, 1));
    assert!(!lt.tile_in_band(0, 2));
}
