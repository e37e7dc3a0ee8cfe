//! Row permutations and symmetric row/column permutations
//!
//! Pivots address a row inside the first block-row of a view:
//! `Pivot { tile_index, element_offset }` names row `element_offset` of
//! tile row `tile_index`. A pivot vector of length `k` applies to rows
//! `0 .. k-1` in `Forward` order and reversed in `Backward` order, so a
//! forward permutation followed by its backward twin restores the matrix
//! bit-for-bit.
//!
//! Remote swaps are paired exchanges: the owner of the diagonal block
//! and the owner of the pivot row each send their row and overwrite with
//! the peer's. Tags separate concurrent permutations per block-column
//! (and, for the symmetric case, per tile-row).

use crate::dtype::Scalar;
use crate::error::Result;
use crate::matrix::{HermitianMatrix, Matrix};
use crate::comm::{TagRange, Transport};
use crate::tile::{Layout, Op, Uplo};
use std::sync::Arc;

/// One pivot: a row within the first block-row of the view
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pivot {
    /// Tile row holding the pivot row
    pub tile_index: i64,
    /// Row offset within that tile
    pub element_offset: i64,
}

impl Pivot {
    /// Construct a pivot
    pub fn new(tile_index: i64, element_offset: i64) -> Self {
        Self {
            tile_index,
            element_offset,
        }
    }
}

/// Application order of a pivot vector
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Apply pivots `0, 1, ..., k-1`
    Forward,
    /// Apply pivots `k-1, ..., 1, 0`
    Backward,
}

fn direction_indices(direction: Direction, len: usize) -> Vec<usize> {
    match direction {
        Direction::Forward => (0..len).collect(),
        Direction::Backward => (0..len).rev().collect(),
    }
}

fn exchange_row<T: Scalar>(
    transport: &Arc<dyn Transport>,
    row: &mut [T],
    peer: usize,
    tag: u32,
) -> Result<()> {
    let mut bytes: Vec<u8> = bytemuck::cast_slice(row).to_vec();
    transport.sendrecv_replace(&mut bytes, peer, tag)?;
    let elem = std::mem::size_of::<T>();
    for (slot, chunk) in row.iter_mut().zip(bytes.chunks_exact(elem)) {
        // received buffers carry no alignment guarantee
        *slot = bytemuck::pod_read_unaligned(chunk);
    }
    Ok(())
}

/// Permute rows of a general view according to `pivots`.
///
/// Local rows are brought to the host in write mode first; each
/// block-column uses its own tag from `tags` so concurrent permutations
/// on different views cannot cross.
pub fn permute_rows<T: Scalar>(
    direction: Direction,
    a: &Matrix<T>,
    pivots: &[Pivot],
    layout: Layout,
    tags: &TagRange,
) -> Result<()> {
    a.tile_get_all_for_writing(layout)?;
    let transport = a.transport().clone();
    let me = transport.rank();

    for j in 0..a.nt() {
        let root_rank = a.tile_rank(0, j);
        let root = me == root_rank;
        let nb = a.tile_nb(j);
        let tag = tags.tag(j as u32);

        for idx in direction_indices(direction, pivots.len()) {
            let i = idx as i64;
            let pivot = pivots[idx];
            let pivot_rank = a.tile_rank(pivot.tile_index, j);

            if pivot_rank == me {
                if root {
                    // pivot on the diagonal block row is a no-op
                    if pivot.tile_index > 0 || pivot.element_offset > i {
                        let top = a.tile_get_for_writing(0, j, layout)?;
                        let mut row_top = vec![T::zero(); nb as usize];
                        top.read_row(i, 0, &mut row_top);
                        if pivot.tile_index == 0 {
                            let mut row_piv = vec![T::zero(); nb as usize];
                            top.read_row(pivot.element_offset, 0, &mut row_piv);
                            top.write_row(i, 0, &row_piv);
                            top.write_row(pivot.element_offset, 0, &row_top);
                        } else {
                            let other = a.tile_get_for_writing(pivot.tile_index, j, layout)?;
                            let mut row_piv = vec![T::zero(); nb as usize];
                            other.read_row(pivot.element_offset, 0, &mut row_piv);
                            top.write_row(i, 0, &row_piv);
                            other.write_row(pivot.element_offset, 0, &row_top);
                        }
                    }
                } else {
                    // paired exchange with the diagonal owner
                    let other = a.tile_get_for_writing(pivot.tile_index, j, layout)?;
                    let mut row = vec![T::zero(); nb as usize];
                    other.read_row(pivot.element_offset, 0, &mut row);
                    exchange_row(&transport, &mut row, root_rank, tag)?;
                    other.write_row(pivot.element_offset, 0, &row);
                }
            } else if root {
                let top = a.tile_get_for_writing(0, j, layout)?;
                let mut row = vec![T::zero(); nb as usize];
                top.read_row(i, 0, &mut row);
                exchange_row(&transport, &mut row, pivot_rank, tag)?;
                top.write_row(i, 0, &row);
            }
        }
    }
    Ok(())
}

/// Swap a partial row of two tiles of a Hermitian matrix, locally or as
/// a paired remote exchange. Swaps
/// `op1(A(t1))[off1, j0 .. j0+n]` with `op2(A(t2))[off2, j0 .. j0+n]`,
/// conjugating both fragments when the ops differ (stored and needed
/// orientations disagree across the diagonal).
#[allow(clippy::too_many_arguments)]
fn swap_row<T: Scalar>(
    j0: i64,
    n: i64,
    a: &HermitianMatrix<T>,
    op1: Op,
    t1: (i64, i64),
    off1: i64,
    op2: Op,
    t2: (i64, i64),
    off2: i64,
    tag: u32,
) -> Result<()> {
    if n <= 0 {
        return Ok(());
    }
    let transport = a.transport().clone();
    let me = transport.rank();
    let conj_both = op1 != op2;

    let view = |g: &crate::coherence::TileGuard<T>, op: Op| {
        if op == Op::NoTrans {
            g.tile()
        } else {
            g.tile().transpose()
        }
    };

    let local1 = a.tile_rank(t1.0, t1.1) == me;
    let local2 = a.tile_rank(t2.0, t2.1) == me;

    if local1 && local2 {
        let g1 = a.tile_get_for_writing(t1.0, t1.1, Layout::ColMajor)?;
        let mut r1 = vec![T::zero(); n as usize];
        view(&g1, op1).read_row(off1, j0, &mut r1);

        if (t1, off1) == (t2, off2) && op1 == op2 {
            return Ok(());
        }
        let g2 = a.tile_get_for_writing(t2.0, t2.1, Layout::ColMajor)?;
        let mut r2 = vec![T::zero(); n as usize];
        view(&g2, op2).read_row(off2, j0, &mut r2);

        if conj_both {
            for v in r1.iter_mut() {
                *v = v.conj();
            }
            for v in r2.iter_mut() {
                *v = v.conj();
            }
        }
        view(&g1, op1).write_row(off1, j0, &r2);
        view(&g2, op2).write_row(off2, j0, &r1);
    } else if local1 {
        let g1 = a.tile_get_for_writing(t1.0, t1.1, Layout::ColMajor)?;
        let mut r1 = vec![T::zero(); n as usize];
        view(&g1, op1).read_row(off1, j0, &mut r1);
        if conj_both {
            for v in r1.iter_mut() {
                *v = v.conj();
            }
        }
        exchange_row(&transport, &mut r1, a.tile_rank(t2.0, t2.1), tag)?;
        view(&g1, op1).write_row(off1, j0, &r1);
    } else if local2 {
        let g2 = a.tile_get_for_writing(t2.0, t2.1, Layout::ColMajor)?;
        let mut r2 = vec![T::zero(); n as usize];
        view(&g2, op2).read_row(off2, j0, &mut r2);
        if conj_both {
            for v in r2.iter_mut() {
                *v = v.conj();
            }
        }
        exchange_row(&transport, &mut r2, a.tile_rank(t1.0, t1.1), tag)?;
        view(&g2, op2).write_row(off2, j0, &r2);
    }
    Ok(())
}

/// Swap single elements `A(t1)[i1, j1]` and `A(t2)[i2, j2]`
fn swap_element<T: Scalar>(
    a: &HermitianMatrix<T>,
    t1: (i64, i64),
    e1: (i64, i64),
    t2: (i64, i64),
    e2: (i64, i64),
    tag: u32,
) -> Result<()> {
    let transport = a.transport().clone();
    let me = transport.rank();
    let local1 = a.tile_rank(t1.0, t1.1) == me;
    let local2 = a.tile_rank(t2.0, t2.1) == me;

    if local1 && local2 {
        let g1 = a.tile_get_for_writing(t1.0, t1.1, Layout::ColMajor)?;
        let g2 = a.tile_get_for_writing(t2.0, t2.1, Layout::ColMajor)?;
        let v1 = g1.get(e1.0, e1.1);
        g1.set_elem(e1.0, e1.1, g2.get(e2.0, e2.1));
        g2.set_elem(e2.0, e2.1, v1);
    } else if local1 {
        let g1 = a.tile_get_for_writing(t1.0, t1.1, Layout::ColMajor)?;
        let mut v = [g1.get(e1.0, e1.1)];
        exchange_row(&transport, &mut v, a.tile_rank(t2.0, t2.1), tag)?;
        g1.set_elem(e1.0, e1.1, v[0]);
    } else if local2 {
        let g2 = a.tile_get_for_writing(t2.0, t2.1, Layout::ColMajor)?;
        let mut v = [g2.get(e2.0, e2.1)];
        exchange_row(&transport, &mut v, a.tile_rank(t1.0, t1.1), tag)?;
        g2.set_elem(e2.0, e2.1, v[0]);
    }
    Ok(())
}

/// Symmetric permutation of rows and columns of a lower-stored Hermitian
/// matrix.
///
/// For each pivot `i1 -> (t2, i2)` the swap decomposes into the
/// strictly-left block rows, the conjugated column/row strip crossing
/// the diagonal, the two diagonal elements, the tile columns below the
/// pivot row, and the conjugation of the crossing element. Tags offset
/// by tile-row so concurrent swaps on different tile-rows stay separate.
pub fn permute_rows_cols<T: Scalar>(
    direction: Direction,
    a: &HermitianMatrix<T>,
    pivots: &[Pivot],
    tags: &TagRange,
) -> Result<()> {
    assert_eq!(a.uplo(), Uplo::Lower, "lower storage required");
    for (i, j) in a.local_tiles() {
        if j <= i {
            a.tile_get_for_writing(i, j, Layout::ColMajor)?;
        }
    }

    let nb0 = a.tile_nb(0);
    for idx in direction_indices(direction, pivots.len()) {
        let i1 = idx as i64;
        let i2 = pivots[idx].element_offset;
        let t2 = pivots[idx].tile_index;
        if t2 == 0 && i2 <= i1 {
            continue;
        }
        let tag = tags.tag(0);

        // strictly-left rows: A(0,0)[i1, 0..i1] <-> A(t2,0)[i2, 0..i1]
        swap_row(0, i1, a, Op::NoTrans, (0, 0), i1, Op::NoTrans, (t2, 0), i2, tag)?;

        if t2 == 0 {
            // within the diagonal tile
            swap_row(
                i1 + 1,
                i2 - i1 - 1,
                a,
                Op::Trans,
                (0, 0),
                i1,
                Op::NoTrans,
                (0, 0),
                i2,
                tag,
            )?;
            swap_row(
                i2 + 1,
                nb0 - i2 - 1,
                a,
                Op::Trans,
                (0, 0),
                i1,
                Op::Trans,
                (0, 0),
                i2,
                tag,
            )?;
        } else {
            // across tiles
            swap_row(
                i1 + 1,
                nb0 - i1 - 1,
                a,
                Op::Trans,
                (0, 0),
                i1,
                Op::NoTrans,
                (t2, 0),
                i2,
                tag,
            )?;
            swap_row(
                0,
                i2,
                a,
                Op::Trans,
                (t2, 0),
                i1,
                Op::NoTrans,
                (t2, t2),
                i2,
                tags.tag(1),
            )?;
            swap_row(
                i2 + 1,
                a.tile_nb(t2) - i2 - 1,
                a,
                Op::Trans,
                (t2, 0),
                i1,
                Op::Trans,
                (t2, t2),
                i2,
                tags.tag(1),
            )?;
        }

        // conjugate the crossing element
        if a.tile_rank(t2, 0) == a.rank() {
            let g = a.tile_get_for_writing(t2, 0, Layout::ColMajor)?;
            g.set_elem(i2, i1, g.get(i2, i1).conj());
        }

        // diagonal elements
        swap_element(a, (0, 0), (i1, i1), (t2, t2), (i2, i2), tag)?;

        // tile rows between the diagonal tile and the pivot tile
        for t in 1..t2 {
            swap_row(
                0,
                a.tile_nb(t),
                a,
                Op::Trans,
                (t, 0),
                i1,
                Op::NoTrans,
                (t2, t),
                i2,
                tags.tag(1 + t as u32),
            )?;
        }
        // tile rows below the pivot tile
        for t in t2 + 1..a.mt() {
            swap_row(
                0,
                a.tile_nb(t),
                a,
                Op::Trans,
                (t, 0),
                i1,
                Op::Trans,
                (t, t2),
                i2,
                tags.tag(1 + t as u32),
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{salt, ChannelTransport};

    fn filled(n: i64, nb: i64) -> Matrix<f64> {
        let t: Arc<dyn Transport> = ChannelTransport::solo();
        let a = Matrix::new(n, n, nb, 1, 1, t).unwrap();
        a.insert_local_tiles().unwrap();
        a.fill_local(|i, j| (i * 100 + j) as f64).unwrap();
        a
    }

    fn snapshot(a: &Matrix<f64>) -> Vec<f64> {
        let mut out = Vec::new();
        for j in 0..a.nt() {
            for i in 0..a.mt() {
                let g = a.tile(i, j).unwrap();
                for jj in 0..g.nb() {
                    for ii in 0..g.mb() {
                        out.push(g.get(ii, jj));
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_permute_rows_roundtrip() {
        let a = filled(12, 4);
        let before = snapshot(&a);
        let pivots = vec![
            Pivot::new(1, 2),
            Pivot::new(0, 3),
            Pivot::new(2, 1),
            Pivot::new(0, 2),
        ];
        let tags = a.tags().reserve(salt::PERMUTE, 0, a.nt() as u32);

        permute_rows(Direction::Forward, &a, &pivots, Layout::ColMajor, &tags).unwrap();
        assert_ne!(snapshot(&a), before);

        permute_rows(Direction::Backward, &a, &pivots, Layout::ColMajor, &tags).unwrap();
        assert_eq!(snapshot(&a), before);
    }

    #[test]
    fn test_permute_rows_moves_pivot_row() {
        let a = filled(8, 4);
        let pivots = vec![Pivot::new(1, 0)];
        let tags = a.tags().reserve(salt::PERMUTE, 0, a.nt() as u32);
        permute_rows(Direction::Forward, &a, &pivots, Layout::ColMajor, &tags).unwrap();

        // row 0 now holds old global row 4, and vice versa
        let g = a.tile(0, 0).unwrap();
        assert_eq!(g.get(0, 0), 400.0);
        drop(g);
        let g = a.tile(1, 0).unwrap();
        assert_eq!(g.get(0, 1), 1.0);
    }

    fn hermitian_filled(n: i64, nb: i64) -> (Matrix<f64>, HermitianMatrix<f64>) {
        let t: Arc<dyn Transport> = ChannelTransport::solo();
        let a = Matrix::new(n, n, nb, 1, 1, t).unwrap();
        a.insert_local_tiles().unwrap();
        // symmetric fill; only the lower triangle is authoritative
        a.fill_local(|i, j| {
            let (r, c) = if i >= j { (i, j) } else { (j, i) };
            (r * 31 + c * 7 + 1) as f64
        })
        .unwrap();
        let h = HermitianMatrix::new(Uplo::Lower, &a).unwrap();
        (a, h)
    }

    /// Reconstruct the full symmetric matrix from the lower storage.
    fn full_from_lower(a: &Matrix<f64>) -> Vec<Vec<f64>> {
        let n = a.m();
        let mut out = vec![vec![0.0; n as usize]; n as usize];
        let nb = a.tile_nb(0);
        for gj in 0..n {
            for gi in 0..n {
                let (r, c) = if gi >= gj { (gi, gj) } else { (gj, gi) };
                let (ti, ri) = (r / nb, r % nb);
                let (tj, cj) = (c / nb, c % nb);
                let g = a.tile(ti, tj).unwrap();
                out[gi as usize][gj as usize] = g.get(ri, cj);
            }
        }
        out
    }

    #[test]
    fn test_symmetric_permutation_matches_dense() {
        let (a, h) = hermitian_filled(12, 4);
        let full = full_from_lower(&a);
        let pivots = vec![Pivot::new(1, 2), Pivot::new(2, 3), Pivot::new(0, 3)];
        let tags = a.tags().reserve(salt::PERMUTE_SYM, 0, 1 + a.mt() as u32);

        permute_rows_cols(Direction::Forward, &h, &pivots, &tags).unwrap();

        // dense reference: swap rows and columns i <-> pivot(i)
        let n = a.m() as usize;
        let nb = a.tile_nb(0) as usize;
        let mut expect = full;
        for (i, p) in pivots.iter().enumerate() {
            let target = p.tile_index as usize * nb + p.element_offset as usize;
            expect.swap(i, target);
            for row in expect.iter_mut() {
                row.swap(i, target);
            }
        }
        let got = full_from_lower(&a);
        for i in 0..n {
            for j in 0..n {
                assert!(
                    (got[i][j] - expect[i][j]).abs() < 1e-12,
                    "({}, {}): {} vs {}",
                    i,
                    j,
                    got[i][j],
                    expect[i][j]
                );
            }
        }
    }

    #[test]
    fn test_symmetric_roundtrip_and_trace() {
        let (a, h) = hermitian_filled(16, 4);
        let before = snapshot(&a);
        let trace_before: f64 = (0..4)
            .map(|t| {
                let g = a.tile(t, t).unwrap();
                (0..g.mb()).map(|i| g.get(i, i)).sum::<f64>()
            })
            .sum();

        // reversal permutation within the constraints of pivot form
        let pivots: Vec<Pivot> = (0..4).map(|i| Pivot::new(3, 3 - i)).collect();
        let tags = a.tags().reserve(salt::PERMUTE_SYM, 0, 1 + a.mt() as u32);
        permute_rows_cols(Direction::Forward, &h, &pivots, &tags).unwrap();

        let trace_after: f64 = (0..4)
            .map(|t| {
                let g = a.tile(t, t).unwrap();
                (0..g.mb()).map(|i| g.get(i, i)).sum::<f64>()
            })
            .sum();
        assert!((trace_before - trace_after).abs() < 1e-12);

        permute_rows_cols(Direction::Backward, &h, &pivots, &tags).unwrap();
        assert_eq!(snapshot(&a), before);
    }
}
