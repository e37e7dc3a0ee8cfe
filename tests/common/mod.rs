//! Common test utilities
#![allow(dead_code)]

use std::sync::Arc;
use tilr::matrix::MatrixStorage;
use tilr::device::DeviceRegistry;
use tilr::prelude::*;

/// Single-rank transport
pub fn solo() -> Arc<dyn Transport> {
    ChannelTransport::solo()
}

/// Run `f` once per rank of an in-process mesh, propagating panics
pub fn mesh_run<F>(p: usize, f: F)
where
    F: Fn(Arc<dyn Transport>) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = ChannelTransport::mesh(p)
        .into_iter()
        .map(|t| {
            let f = f.clone();
            std::thread::spawn(move || f(t))
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// Deterministic hash fill, identical on every rank
pub fn hval(seed: u64, i: i64, j: i64) -> f64 {
    let mut x = seed
        ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (j as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    (x as f64 / u64::MAX as f64) - 0.5
}

/// Symmetric positive-definite test value: diagonally dominant
pub fn spd_val(n: i64, i: i64, j: i64) -> f64 {
    if i == j {
        n as f64
    } else {
        let (r, c) = if i >= j { (i, j) } else { (j, i) };
        hval(7, r, c)
    }
}

/// Uniform-tile matrix on a block-cyclic grid, local tiles inserted
pub fn dist_matrix(
    transport: Arc<dyn Transport>,
    m: i64,
    n: i64,
    nb: i64,
    p: usize,
    q: usize,
) -> Matrix<f64> {
    let a = Matrix::new(m, n, nb, p, q, transport).unwrap();
    a.insert_local_tiles().unwrap();
    a
}

/// Uniform-tile matrix backed by `d` host-staged devices
pub fn dist_matrix_with_devices(
    transport: Arc<dyn Transport>,
    n: i64,
    nb: i64,
    d: u32,
) -> Matrix<f64> {
    let a = Matrix::with_tile_fns(
        n,
        n,
        Arc::new(move |_| nb),
        Arc::new(move |_| nb),
        (1, 1),
        MatrixStorage::<f64>::block_cyclic_owner(1, 1),
        MatrixStorage::<f64>::row_device_affinity(d),
        transport,
        Arc::new(DeviceRegistry::staged(d)),
    )
    .unwrap();
    a.insert_local_tiles().unwrap();
    a
}

/// Same-shape deep copy sharing nothing with the source
pub fn deep_copy(a: &Matrix<f64>) -> Matrix<f64> {
    let b = a.empty_like().unwrap();
    b.insert_local_tiles().unwrap();
    for (i, j) in a.local_tiles() {
        let src = a.tile(i, j).unwrap();
        let dst = b.tile_get_for_writing(i, j, Layout::ColMajor).unwrap();
        src.copy_to(&dst.tile());
    }
    b
}

/// Read one global element from a locally-owned tile
pub fn get_global(a: &Matrix<f64>, gi: i64, gj: i64) -> Option<f64> {
    let mut at = 0;
    let mut ti = 0;
    while at + a.tile_mb(ti) <= gi {
        at += a.tile_mb(ti);
        ti += 1;
    }
    let ri = gi - at;
    let mut at = 0;
    let mut tj = 0;
    while at + a.tile_nb(tj) <= gj {
        at += a.tile_nb(tj);
        tj += 1;
    }
    let cj = gj - at;
    if !a.tile_is_local(ti, tj) {
        return None;
    }
    Some(a.tile(ti, tj).unwrap().get(ri, cj))
}

/// Max absolute difference over this rank's tiles of two same-shape
/// matrices
pub fn local_max_diff(a: &Matrix<f64>, b: &Matrix<f64>) -> f64 {
    let mut worst: f64 = 0.0;
    for (i, j) in a.local_tiles() {
        let ga = a.tile(i, j).unwrap();
        let gb = b.tile(i, j).unwrap();
        for jj in 0..ga.nb() {
            for ii in 0..ga.mb() {
                worst = worst.max((ga.get(ii, jj) - gb.get(ii, jj)).abs());
            }
        }
    }
    worst
}

/// Frobenius norm over this rank's tiles
pub fn local_frob(a: &Matrix<f64>) -> f64 {
    let mut s = 0.0;
    for (i, j) in a.local_tiles() {
        let g = a.tile(i, j).unwrap();
        for jj in 0..g.nb() {
            for ii in 0..g.mb() {
                s += g.get(ii, jj).powi(2);
            }
        }
    }
    s.sqrt()
}
