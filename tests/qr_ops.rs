//! QR factorization scenarios: reconstruction, lookahead equivalence,
//! distributed triangle-triangle reduction

mod common;

use common::{deep_copy, dist_matrix, hval, local_max_diff, mesh_run, solo};
use tilr::algorithm;
use tilr::kernel::Side;
use tilr::matrix::TriangularFactors;
use tilr::prelude::*;

/// Masked copy of the upper trapezoid (R) of a factored matrix
fn extract_r(a: &Matrix<f64>) -> Matrix<f64> {
    let r = a.empty_like().unwrap();
    r.insert_local_tiles().unwrap();
    for (i, j) in a.local_tiles() {
        let src = a.tile(i, j).unwrap();
        let dst = r.tile_get_for_writing(i, j, Layout::ColMajor).unwrap();
        for jj in 0..src.nb() {
            for ii in 0..src.mb() {
                let keep = i < j || (i == j && ii <= jj);
                dst.set_elem(ii, jj, if keep { src.get(ii, jj) } else { 0.0 });
            }
        }
    }
    r
}

#[test]
fn test_qr_identity_reconstruction() {
    // factor the identity, multiply Q R back, expect the identity
    let (n, nb) = (256i64, 64i64);
    let a = dist_matrix(solo(), n, n, nb, 1, 1);
    algorithm::set(0.0, 1.0, &a, &Options::default()).unwrap();

    let mut t = TriangularFactors::new(&a).unwrap();
    algorithm::geqrf(&a, &mut t, &Options::default()).unwrap();

    let qr = extract_r(&a);
    algorithm::unmqr(Side::Left, Op::NoTrans, &a, &t, &qr, &Options::default()).unwrap();

    for (i, j) in qr.local_tiles() {
        let g = qr.tile(i, j).unwrap();
        for jj in 0..g.nb() {
            for ii in 0..g.mb() {
                let want = if i == j && ii == jj { 1.0 } else { 0.0 };
                assert!(
                    (g.get(ii, jj) - want).abs() < 1e-13,
                    "tile ({}, {}) element ({}, {})",
                    i,
                    j,
                    ii,
                    jj
                );
            }
        }
    }
}

#[test]
fn test_qr_qh_times_a_equals_r() {
    let (n, nb) = (96i64, 32i64);
    let a = dist_matrix(solo(), n, n, nb, 1, 1);
    a.fill_local(|i, j| hval(60, i, j)).unwrap();
    let a0 = deep_copy(&a);

    let mut t = TriangularFactors::new(&a).unwrap();
    algorithm::geqrf(&a, &mut t, &Options::default()).unwrap();

    // Q^H A0 should reproduce R and annihilate the lower trapezoid
    algorithm::unmqr(Side::Left, Op::ConjTrans, &a, &t, &a0, &Options::default()).unwrap();
    let r = extract_r(&a);

    for gi in 0..n {
        for gj in 0..n {
            let got = common::get_global(&a0, gi, gj).unwrap();
            if gi <= gj {
                let want = common::get_global(&r, gi, gj).unwrap();
                assert!((got - want).abs() < 1e-11, "({}, {})", gi, gj);
            } else {
                assert!(got.abs() < 1e-11, "({}, {}) = {}", gi, gj, got);
            }
        }
    }
}

#[test]
fn test_qr_rectangular_tall() {
    let (m, n, nb) = (80i64, 48i64, 16i64);
    let a = dist_matrix(solo(), m, n, nb, 1, 1);
    a.fill_local(|i, j| hval(61, i, j)).unwrap();
    let a0 = deep_copy(&a);

    let mut t = TriangularFactors::new(&a).unwrap();
    algorithm::geqrf(&a, &mut t, &Options::default()).unwrap();

    let qr = extract_r(&a);
    algorithm::unmqr(Side::Left, Op::NoTrans, &a, &t, &qr, &Options::default()).unwrap();
    assert!(local_max_diff(&qr, &a0) < 1e-11);
}

#[test]
fn test_qr_lookahead_equivalence() {
    let (n, nb) = (192i64, 48i64);
    let mut factored = Vec::new();
    for lookahead in [0, 1, 4] {
        let a = dist_matrix(solo(), n, n, nb, 1, 1);
        a.fill_local(|i, j| hval(62, i, j)).unwrap();
        let mut t = TriangularFactors::new(&a).unwrap();
        algorithm::geqrf(&a, &mut t, &Options::with_lookahead(lookahead)).unwrap();
        factored.push(a);
    }
    for pair in factored.windows(2) {
        assert!(local_max_diff(&pair[0], &pair[1]) < 1e-11);
    }
}

#[test]
fn test_qr_distributed_reconstruction() {
    let (n, nb) = (128i64, 32i64);
    mesh_run(4, move |transport| {
        let a = dist_matrix(transport.clone(), n, n, nb, 2, 2);
        a.fill_local(|i, j| hval(63, i, j)).unwrap();

        let mut t = TriangularFactors::new(&a).unwrap();
        algorithm::geqrf(&a, &mut t, &Options::default()).unwrap();
        transport.barrier().unwrap();

        let qr = extract_r(&a);
        algorithm::unmqr(Side::Left, Op::NoTrans, &a, &t, &qr, &Options::default()).unwrap();

        // Q R must reproduce the original fill on this rank's tiles
        for (ti, tj) in qr.local_tiles() {
            let g = qr.tile(ti, tj).unwrap();
            for jj in 0..g.nb() {
                for ii in 0..g.mb() {
                    let want = hval(63, ti * nb + ii, tj * nb + jj);
                    assert!(
                        (g.get(ii, jj) - want).abs() < 1e-10,
                        "rank {} tile ({}, {})",
                        transport.rank(),
                        ti,
                        tj
                    );
                }
            }
        }
        transport.barrier().unwrap();
    });
}

#[test]
fn test_qr_distributed_lookahead_equivalence() {
    let (n, nb) = (128i64, 32i64);
    mesh_run(4, move |transport| {
        let mut factored = Vec::new();
        for lookahead in [0, 1, 4] {
            let a = dist_matrix(transport.clone(), n, n, nb, 2, 2);
            a.fill_local(|i, j| hval(64, i, j)).unwrap();
            let mut t = TriangularFactors::new(&a).unwrap();
            algorithm::geqrf(&a, &mut t, &Options::with_lookahead(lookahead)).unwrap();
            transport.barrier().unwrap();
            factored.push(a);
        }
        for pair in factored.windows(2) {
            assert!(
                local_max_diff(&pair[0], &pair[1]) < 1e-11,
                "rank {}",
                transport.rank()
            );
        }
        transport.barrier().unwrap();
    });
}
