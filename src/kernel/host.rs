//! Portable reference kernels
//!
//! Straightforward loop implementations of the tile-kernel contract.
//! They favour clarity over blocking; trailing updates in the panel
//! factorization parallelise over columns on the current rayon pool, so
//! a nested panel region uses the panel pool it runs inside.

use super::{Side, TileKernels};
use crate::dtype::Scalar;
use crate::tile::{Diag, Op, Tile, Uplo};
use rayon::prelude::*;

/// Reference host kernel set
pub struct HostKernels;

/// Row offsets of a stack of tiles
fn stack_offsets<T: Scalar>(tiles: &[Tile<T>]) -> Vec<i64> {
    let mut offs = vec![0];
    for t in tiles {
        offs.push(offs.last().unwrap() + t.mb());
    }
    offs
}

#[inline]
fn stacked_get<T: Scalar>(tiles: &[Tile<T>], offs: &[i64], r: i64, c: i64) -> T {
    let k = offs.partition_point(|&o| o <= r) - 1;
    tiles[k].get(r - offs[k], c)
}

#[inline]
fn stacked_set<T: Scalar>(tiles: &[Tile<T>], offs: &[i64], r: i64, c: i64, v: T) {
    let k = offs.partition_point(|&o| o <= r) - 1;
    tiles[k].set_elem(r - offs[k], c, v);
}

/// Reflector element `w_c[r]` of a stacked panel: implicit unit diagonal,
/// zero above it, stored below.
#[inline]
fn v_get<T: Scalar>(tiles: &[Tile<T>], offs: &[i64], r: i64, c: i64) -> T {
    use std::cmp::Ordering;
    match r.cmp(&c) {
        Ordering::Less => T::zero(),
        Ordering::Equal => T::one(),
        Ordering::Greater => stacked_get(tiles, offs, r, c),
    }
}

/// Householder generator: given the pivot `alpha` and the squared norm
/// of the sub-pivot column, produce `(beta, tau, scale)` with
/// `(I - conj(tau) w w^H) [alpha; x] = [beta; 0]`, `v = scale * x`.
fn larfg<T: Scalar>(alpha: T, norm2_below: f64) -> (f64, T, T) {
    let ar = alpha.real();
    let ai = alpha.imag();
    if norm2_below == 0.0 && ai == 0.0 {
        return (ar, T::zero(), T::zero());
    }
    let mag = (ar * ar + ai * ai + norm2_below).sqrt();
    let beta = if ar >= 0.0 { -mag } else { mag };
    let tau = T::from_parts((beta - ar) / beta, -ai / beta);
    let scale = T::one() / (alpha - T::from_real(beta));
    (beta, tau, scale)
}

/// Multiply `w <- op(T) w` for the upper-triangular reflector factor.
fn trmv_t_factor<T: Scalar>(t: &Tile<T>, op: Op, k: i64, w: &mut [T]) {
    match op {
        Op::ConjTrans => {
            // lower-triangular product, bottom row first
            for i in (0..k).rev() {
                let mut s = T::zero();
                for j in 0..=i {
                    s += t.get(j, i).conj() * w[j as usize];
                }
                w[i as usize] = s;
            }
        }
        _ => {
            for i in 0..k {
                let mut s = T::zero();
                for j in i..k {
                    s += t.get(i, j) * w[j as usize];
                }
                w[i as usize] = s;
            }
        }
    }
}

impl<T: Scalar> TileKernels<T> for HostKernels {
    fn gemm(alpha: T, a: &Tile<T>, b: &Tile<T>, beta: T, c: &Tile<T>) {
        let (m, n, kk) = (c.mb(), c.nb(), a.nb());
        debug_assert_eq!(a.mb(), m);
        debug_assert_eq!(b.mb(), kk);
        debug_assert_eq!(b.nb(), n);
        for j in 0..n {
            for i in 0..m {
                let mut s = T::zero();
                for k in 0..kk {
                    s += a.get(i, k) * b.get(k, j);
                }
                c.set_elem(i, j, alpha * s + beta * c.get(i, j));
            }
        }
    }

    fn trsm(side: Side, alpha: T, a: &Tile<T>, b: &Tile<T>) {
        let unit = a.diag() == Diag::Unit;
        match side {
            Side::Left => {
                let n = b.mb();
                debug_assert_eq!(a.mb(), n);
                for j in 0..b.nb() {
                    match a.uplo() {
                        Uplo::Lower => {
                            for i in 0..n {
                                let mut s = alpha * b.get(i, j);
                                for k in 0..i {
                                    s -= a.get(i, k) * b.get(k, j);
                                }
                                if !unit {
                                    s = s / a.get(i, i);
                                }
                                b.set_elem(i, j, s);
                            }
                        }
                        _ => {
                            for i in (0..n).rev() {
                                let mut s = alpha * b.get(i, j);
                                for k in i + 1..n {
                                    s -= a.get(i, k) * b.get(k, j);
                                }
                                if !unit {
                                    s = s / a.get(i, i);
                                }
                                b.set_elem(i, j, s);
                            }
                        }
                    }
                }
            }
            Side::Right => {
                let n = b.nb();
                debug_assert_eq!(a.mb(), n);
                for i in 0..b.mb() {
                    match a.uplo() {
                        Uplo::Upper => {
                            for j in 0..n {
                                let mut s = alpha * b.get(i, j);
                                for k in 0..j {
                                    s -= b.get(i, k) * a.get(k, j);
                                }
                                if !unit {
                                    s = s / a.get(j, j);
                                }
                                b.set_elem(i, j, s);
                            }
                        }
                        _ => {
                            for j in (0..n).rev() {
                                let mut s = alpha * b.get(i, j);
                                for k in j + 1..n {
                                    s -= b.get(i, k) * a.get(k, j);
                                }
                                if !unit {
                                    s = s / a.get(j, j);
                                }
                                b.set_elem(i, j, s);
                            }
                        }
                    }
                }
            }
        }
    }

    fn herk(alpha: f64, a: &Tile<T>, beta: f64, c: &Tile<T>) {
        let n = c.mb();
        let kk = a.nb();
        debug_assert_eq!(a.mb(), n);
        let al = T::from_real(alpha);
        let be = T::from_real(beta);
        let lower = c.uplo() != Uplo::Upper;
        for j in 0..n {
            let (lo, hi) = if lower { (j, n) } else { (0, j + 1) };
            for i in lo..hi {
                let mut s = T::zero();
                for k in 0..kk {
                    s += a.get(i, k) * a.get(j, k).conj();
                }
                let v = al * s + be * c.get(i, j);
                if i == j {
                    // Hermitian diagonal stays real
                    c.set_elem(i, j, T::from_real(v.real()));
                } else {
                    c.set_elem(i, j, v);
                }
            }
        }
    }

    fn potrf(a: &Tile<T>) -> i64 {
        let view = if a.uplo() == Uplo::Upper {
            a.conj_transpose()
        } else {
            *a
        };
        let n = view.mb();
        for k in 0..n {
            let mut d = view.get(k, k).real();
            for j in 0..k {
                d -= view.get(k, j).abs().powi(2);
            }
            if d <= 0.0 || !d.is_finite() {
                return k + 1;
            }
            let dk = d.sqrt();
            view.set_elem(k, k, T::from_real(dk));
            for i in k + 1..n {
                let mut s = view.get(i, k);
                for j in 0..k {
                    s -= view.get(i, j) * view.get(k, j).conj();
                }
                view.set_elem(i, k, s / T::from_real(dk));
            }
        }
        0
    }

    fn geqrf(panel: &[Tile<T>], t: &Tile<T>, ib: i64) {
        let offs = stack_offsets(panel);
        let m = *offs.last().unwrap();
        let nb = panel[0].nb();
        let k = m.min(nb);
        let chunk = ib.max(1) as usize;
        let mut taus = vec![T::zero(); k as usize];

        for jj in 0..k {
            let mut nrm2 = 0.0;
            for r in jj + 1..m {
                nrm2 += stacked_get(panel, &offs, r, jj).abs().powi(2);
            }
            let alpha = stacked_get(panel, &offs, jj, jj);
            let (beta, tau, scale) = larfg(alpha, nrm2);
            taus[jj as usize] = tau;
            if tau != T::zero() {
                for r in jj + 1..m {
                    let v = stacked_get(panel, &offs, r, jj) * scale;
                    stacked_set(panel, &offs, r, jj, v);
                }
            }
            stacked_set(panel, &offs, jj, jj, T::from_real(beta));

            if tau != T::zero() && jj + 1 < nb {
                let ct = tau.conj();
                let cols: Vec<i64> = (jj + 1..nb).collect();
                cols.par_chunks(chunk).for_each(|chunk_cols| {
                    for &jc in chunk_cols {
                        let mut s = stacked_get(panel, &offs, jj, jc);
                        for r in jj + 1..m {
                            s += stacked_get(panel, &offs, r, jj).conj()
                                * stacked_get(panel, &offs, r, jc);
                        }
                        let upd = ct * s;
                        let top = stacked_get(panel, &offs, jj, jc) - upd;
                        stacked_set(panel, &offs, jj, jc, top);
                        for r in jj + 1..m {
                            let v = stacked_get(panel, &offs, r, jc)
                                - upd * stacked_get(panel, &offs, r, jj);
                            stacked_set(panel, &offs, r, jc, v);
                        }
                    }
                });
            }
        }

        // forward columnwise T factor: T(0..i, i) = -tau_i T (V^H v_i)
        for i in 0..k {
            t.set_elem(i, i, taus[i as usize]);
            for row in 0..i {
                t.set_elem(row, i, T::zero());
            }
            if taus[i as usize] == T::zero() {
                continue;
            }
            let mut z = vec![T::zero(); i as usize];
            for j in 0..i {
                let mut s = stacked_get(panel, &offs, i, j).conj();
                for r in i + 1..m {
                    s += stacked_get(panel, &offs, r, j).conj()
                        * stacked_get(panel, &offs, r, i);
                }
                z[j as usize] = s;
            }
            for row in 0..i {
                let mut s = T::zero();
                for c in row..i {
                    s += t.get(row, c) * z[c as usize];
                }
                t.set_elem(row, i, T::zero() - taus[i as usize] * s);
            }
        }
    }

    fn unmqr(op: Op, panel: &[Tile<T>], t: &Tile<T>, c: &[Tile<T>]) {
        let offs = stack_offsets(panel);
        let m = *offs.last().unwrap();
        let k = m.min(panel[0].nb());
        let c_offs = stack_offsets(c);
        debug_assert_eq!(*c_offs.last().unwrap(), m);
        let cnb = c[0].nb();

        let cols: Vec<i64> = (0..cnb).collect();
        cols.par_iter().for_each(|&col| {
            // W = V^H C(:, col)
            let mut w = vec![T::zero(); k as usize];
            for ci in 0..k {
                let mut s = stacked_get(c, &c_offs, ci, col);
                for r in ci + 1..m {
                    s += stacked_get(panel, &offs, r, ci).conj()
                        * stacked_get(c, &c_offs, r, col);
                }
                w[ci as usize] = s;
            }
            trmv_t_factor(t, op, k, &mut w);
            // C(:, col) -= V W
            for r in 0..m {
                let mut s = T::zero();
                for ci in 0..k.min(r + 1) {
                    s += v_get(panel, &offs, r, ci) * w[ci as usize];
                }
                let v = stacked_get(c, &c_offs, r, col) - s;
                stacked_set(c, &c_offs, r, col, v);
            }
        });
    }

    fn ttqrt(a: &Tile<T>, b: &Tile<T>, t: &Tile<T>) {
        // triangle-triangle case of the pentagonal factorization: the
        // reflector block V stays upper triangular, so only rows 0..=i
        // of b's column i are ever touched. Rows of b below its
        // triangle (the local panel reflectors) are preserved.
        let n = a.nb().min(b.nb());
        let p = b.mb();
        let mut taus = vec![T::zero(); n as usize];

        for i in 0..n {
            let top = i.min(p - 1);
            let mut nrm2 = 0.0;
            for r in 0..=top {
                nrm2 += b.get(r, i).abs().powi(2);
            }
            let alpha = a.get(i, i);
            let (beta, tau, scale) = larfg(alpha, nrm2);
            taus[i as usize] = tau;
            if tau != T::zero() {
                for r in 0..=top {
                    b.set_elem(r, i, b.get(r, i) * scale);
                }
            }
            a.set_elem(i, i, T::from_real(beta));

            if tau != T::zero() {
                let ct = tau.conj();
                for jc in i + 1..n {
                    // w = [e_i; v]: only row i of R1 participates
                    let mut s = a.get(i, jc);
                    for r in 0..=top {
                        s += b.get(r, i).conj() * b.get(r, jc);
                    }
                    let upd = ct * s;
                    a.set_elem(i, jc, a.get(i, jc) - upd);
                    for r in 0..=top {
                        b.set_elem(r, jc, b.get(r, jc) - upd * b.get(r, i));
                    }
                }
            }
        }

        for i in 0..n {
            t.set_elem(i, i, taus[i as usize]);
            for row in 0..i {
                t.set_elem(row, i, T::zero());
            }
            if taus[i as usize] == T::zero() {
                continue;
            }
            let top = i.min(p - 1);
            // z_j = v_j^H v_i (the e_j parts are orthogonal)
            let mut z = vec![T::zero(); i as usize];
            for j in 0..i {
                let mut s = T::zero();
                for r in 0..=j.min(top) {
                    s += b.get(r, j).conj() * b.get(r, i);
                }
                z[j as usize] = s;
            }
            for row in 0..i {
                let mut s = T::zero();
                for c in row..i {
                    s += t.get(row, c) * z[c as usize];
                }
                t.set_elem(row, i, T::zero() - taus[i as usize] * s);
            }
        }
    }

    fn ttmqr(op: Op, v: &Tile<T>, t: &Tile<T>, c_top: &Tile<T>, c_bot: &Tile<T>) {
        // V is the upper-triangular reflector block written by ttqrt;
        // entries below its triangle belong to the local panel and are
        // treated as zero.
        let k = v.nb().min(v.mb());
        let cnb = c_top.nb();
        debug_assert_eq!(c_bot.nb(), cnb);
        debug_assert!(c_top.mb() >= k && c_bot.mb() >= k);

        let cols: Vec<i64> = (0..cnb).collect();
        cols.par_iter().for_each(|&col| {
            // W = C1(0..k) + V^H C2
            let mut w = vec![T::zero(); k as usize];
            for i in 0..k {
                let mut s = c_top.get(i, col);
                for r in 0..=i {
                    s += v.get(r, i).conj() * c_bot.get(r, col);
                }
                w[i as usize] = s;
            }
            trmv_t_factor(t, op, k, &mut w);
            for i in 0..k {
                c_top.set_elem(i, col, c_top.get(i, col) - w[i as usize]);
            }
            for r in 0..k {
                let mut s = T::zero();
                for i in r..k {
                    s += v.get(r, i) * w[i as usize];
                }
                c_bot.set_elem(r, col, c_bot.get(r, col) - s);
            }
        });
    }

    fn scale_row_col(r: &[f64], c: &[f64], a: &Tile<T>) {
        for j in 0..a.nb() {
            for i in 0..a.mb() {
                let f = T::from_real(r[i as usize] * c[j as usize]);
                a.set_elem(i, j, a.get(i, j) * f);
            }
        }
    }
}
