//! Tile kernels: the black-box callable seam
//!
//! The runtime treats dense BLAS/LAPACK tile kernels as supplied
//! callables; [`TileKernels`] fixes the contract and [`HostKernels`]
//! provides portable reference implementations (plain loops, no
//! blocking) that the built-in drivers and the test suite run on.
//! An optimised BLAS binding implements the same trait.
//!
//! Conventions: reflectors are `H = I - tau w w^H` with `w = [1; v]`;
//! factorizations apply `H^H` from the left, so `A = Q R` with
//! `Q = H_1 ... H_k = I - V T V^H` and `T` from the forward columnwise
//! recurrence.

mod host;

pub use host::HostKernels;

use crate::dtype::Scalar;
use crate::tile::Tile;

/// Which side a triangular or reflector operand applies from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    /// Operate on the left: `op(A) X = B` or `Q C`
    Left,
    /// Operate on the right: `X op(A) = B` or `C Q`
    Right,
}

/// The tile-kernel set consumed by the runtime's internal operations
///
/// Every tile argument carries its own logical op/uplo/diag; kernels
/// honour them through element access. Scalar coefficients of Hermitian
/// updates are real by definition.
pub trait TileKernels<T: Scalar>: Send + Sync {
    /// `C := alpha * A * B + beta * C`
    fn gemm(alpha: T, a: &Tile<T>, b: &Tile<T>, beta: T, c: &Tile<T>);

    /// Solve `A X = alpha B` (Left) or `X A = alpha B` (Right) with
    /// triangular `A`; `X` overwrites `B`.
    fn trsm(side: Side, alpha: T, a: &Tile<T>, b: &Tile<T>);

    /// `C := alpha * A * A^H + beta * C` on the stored triangle of `C`
    fn herk(alpha: f64, a: &Tile<T>, beta: f64, c: &Tile<T>);

    /// Cholesky of a diagonal tile (on its stored triangle).
    ///
    /// Returns 0 on success, or the 1-based index of the first
    /// non-positive pivot.
    fn potrf(a: &Tile<T>) -> i64;

    /// Householder QR of a stacked panel.
    ///
    /// `panel[0]` holds R on and above the diagonal and reflector rows
    /// below it; subsequent tiles hold reflector rows. `t` receives the
    /// block-reflector T factor (upper triangular, k x k in its top-left
    /// corner). `ib` is the internal update blocking.
    fn geqrf(panel: &[Tile<T>], t: &Tile<T>, ib: i64);

    /// Apply `Q` or `Q^H` from a stacked panel factorization to the
    /// stacked tiles `c` (side = Left).
    fn unmqr(op: crate::tile::Op, panel: &[Tile<T>], t: &Tile<T>, c: &[Tile<T>]);

    /// Triangle-triangle QR: factor `[R1; R2]` where `a` holds upper
    /// triangular R1 (overwritten with R) and `b` holds R2 (overwritten
    /// with the reflector block V). `t` receives the T factor.
    fn ttqrt(a: &Tile<T>, b: &Tile<T>, t: &Tile<T>);

    /// Apply the `ttqrt` reflectors to the pair `[C1; C2]`
    fn ttmqr(op: crate::tile::Op, v: &Tile<T>, t: &Tile<T>, c_top: &Tile<T>, c_bot: &Tile<T>);

    /// Scale a tile's rows and columns: `A(i, j) *= r[i] * c[j]`
    fn scale_row_col(r: &[f64], c: &[f64], a: &Tile<T>);
}
