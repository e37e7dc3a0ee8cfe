//! Cholesky factorization and solve scenarios (full and band)

mod common;

use common::{deep_copy, dist_matrix, dist_matrix_with_devices, hval, local_frob, local_max_diff, mesh_run, solo, spd_val};
use tilr::algorithm;
use tilr::prelude::*;

fn spd_matrix(transport: std::sync::Arc<dyn Transport>, n: i64, nb: i64, p: usize, q: usize) -> Matrix<f64> {
    let a = dist_matrix(transport, n, n, nb, p, q);
    a.fill_local(|i, j| spd_val(n, i, j)).unwrap();
    a
}

#[test]
fn test_potrf_potrs_residual() {
    let (n, nb) = (96i64, 32i64);
    let a = spd_matrix(solo(), n, nb, 1, 1);
    let a0 = deep_copy(&a);
    let h = HermitianMatrix::new(Uplo::Lower, &a).unwrap();

    algorithm::potrf(&h, &Options::default()).unwrap();

    let b = dist_matrix(solo(), n, n, nb, 1, 1);
    b.fill_local(|i, j| hval(40, i, j)).unwrap();
    let x = deep_copy(&b);
    algorithm::potrs(&h, &x, &Options::default()).unwrap();

    // residual = || A x - b || / || b ||
    let r = deep_copy(&b);
    algorithm::gemm(1.0, &a0, &x, -1.0, &r, &Options::default()).unwrap();
    let rel = local_frob(&r) / local_frob(&b);
    assert!(rel < 1e-10, "relative residual {}", rel);
}

#[test]
fn test_potrf_reconstructs() {
    let (n, nb) = (64i64, 16i64);
    let a = spd_matrix(solo(), n, nb, 1, 1);
    let a0 = deep_copy(&a);
    let h = HermitianMatrix::new(Uplo::Lower, &a).unwrap();
    algorithm::potrf(&h, &Options::default()).unwrap();

    // L L^T, with L read from the factored lower triangle
    let l = dist_matrix(solo(), n, n, nb, 1, 1);
    l.fill_local(|_, _| 0.0).unwrap();
    for gi in 0..n {
        for gj in 0..=gi {
            let v = common::get_global(&a, gi, gj).unwrap();
            let (ti, ri) = (gi / nb, gi % nb);
            let (tj, cj) = (gj / nb, gj % nb);
            let g = l.tile_get_for_writing(ti, tj, Layout::ColMajor).unwrap();
            g.set_elem(ri, cj, v);
        }
    }
    let out = dist_matrix(solo(), n, n, nb, 1, 1);
    out.fill_local(|_, _| 0.0).unwrap();
    algorithm::gemm(1.0, &l, &l.transpose(), 0.0, &out, &Options::default()).unwrap();

    for gi in (0..n).step_by(7) {
        for gj in (0..=gi).step_by(5) {
            let got = common::get_global(&out, gi, gj).unwrap();
            let want = common::get_global(&a0, gi, gj).unwrap();
            assert!((got - want).abs() < 1e-10, "({}, {})", gi, gj);
        }
    }
}

#[test]
fn test_potrf_reports_first_bad_pivot() {
    let (n, nb) = (32i64, 16i64);
    let a = dist_matrix(solo(), n, n, nb, 1, 1);
    // leading block is fine, trailing block is indefinite
    a.fill_local(|i, j| {
        if i == j {
            if i < 20 { n as f64 } else { -1.0 }
        } else {
            let (r, c) = if i >= j { (i, j) } else { (j, i) };
            hval(41, r, c) * 0.01
        }
    })
    .unwrap();
    let h = HermitianMatrix::new(Uplo::Lower, &a).unwrap();

    let err = algorithm::potrf(&h, &Options::default()).unwrap_err();
    match err {
        Error::Numerical { info } => assert_eq!(info, 21),
        other => panic!("expected a numerical failure, got {}", other),
    }
}

#[test]
fn test_potrf_distributed_matches_solo() {
    let (n, nb) = (128i64, 32i64);
    mesh_run(4, move |transport| {
        let a = spd_matrix(transport.clone(), n, nb, 2, 2);
        let h = HermitianMatrix::new(Uplo::Lower, &a).unwrap();
        algorithm::potrf(&h, &Options::default()).unwrap();

        // every rank recomputes the factorization single-handed
        let reference = spd_matrix(solo(), n, nb, 1, 1);
        let href = HermitianMatrix::new(Uplo::Lower, &reference).unwrap();
        algorithm::potrf(&href, &Options::default()).unwrap();

        for (ti, tj) in a.local_tiles() {
            if tj > ti {
                continue;
            }
            let g = a.tile(ti, tj).unwrap();
            for jj in 0..g.nb() {
                for ii in 0..g.mb() {
                    let (gi, gj) = (ti * nb + ii, tj * nb + jj);
                    if gi < gj {
                        continue;
                    }
                    let want = common::get_global(&reference, gi, gj).unwrap();
                    assert!(
                        (g.get(ii, jj) - want).abs() < 1e-10,
                        "rank {} ({}, {})",
                        transport.rank(),
                        gi,
                        gj
                    );
                }
            }
        }
        transport.barrier().unwrap();
    });
}

#[test]
fn test_potrf_lookahead_equivalence() {
    let (n, nb) = (96i64, 24i64);
    let mut factored = Vec::new();
    for lookahead in [0, 1, 4] {
        let a = spd_matrix(solo(), n, nb, 1, 1);
        let h = HermitianMatrix::new(Uplo::Lower, &a).unwrap();
        algorithm::potrf(&h, &Options::with_lookahead(lookahead)).unwrap();
        factored.push(a);
    }
    for pair in factored.windows(2) {
        assert!(local_max_diff(&pair[0], &pair[1]) < 1e-11);
    }
}

#[test]
fn test_potrf_target_equivalence() {
    let (n, nb) = (64i64, 16i64);
    let mut factored = Vec::new();
    for target in [
        Target::HostTask,
        Target::HostNest,
        Target::HostBatch,
        Target::Devices,
    ] {
        let a = if target == Target::Devices {
            dist_matrix_with_devices(solo(), n, nb, 2)
        } else {
            dist_matrix(solo(), n, n, nb, 1, 1)
        };
        a.fill_local(|i, j| spd_val(n, i, j)).unwrap();
        let h = HermitianMatrix::new(Uplo::Lower, &a).unwrap();
        algorithm::potrf(&h, &Options::with_target(target)).unwrap();
        factored.push(deep_copy(&a));
    }
    for pair in factored.windows(2) {
        assert!(local_max_diff(&pair[0], &pair[1]) < 1e-11);
    }
}

#[test]
fn test_pbtrf_pbtrs_band_residual() {
    let (n, nb) = (96i64, 32i64);
    let kd = nb;
    let band_val = move |i: i64, j: i64| {
        if (i - j).abs() > kd {
            0.0
        } else {
            spd_val(n, i, j)
        }
    };

    let a = dist_matrix(solo(), n, n, nb, 1, 1);
    a.fill_local(band_val).unwrap();
    let a0 = deep_copy(&a);
    let hb = HermitianBandMatrix::new(Uplo::Lower, kd, &a).unwrap();

    algorithm::pbtrf(&hb, &Options::default()).unwrap();

    let b = dist_matrix(solo(), n, n / 2, nb, 1, 1);
    b.fill_local(|i, j| hval(42, i, j)).unwrap();
    let x = deep_copy(&b);
    algorithm::pbtrs(&hb, &x, &Options::default()).unwrap();

    let r = deep_copy(&b);
    algorithm::gemm(1.0, &a0, &x, -1.0, &r, &Options::default()).unwrap();
    let rel = local_frob(&r) / local_frob(&b);
    assert!(rel < 1e-10, "relative band residual {}", rel);
}
