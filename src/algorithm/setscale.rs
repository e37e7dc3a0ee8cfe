//! Trapezoidal fills and row/column scalings

use super::internal;
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::options::Options;

/// Set every element of the view to `offdiag` off the diagonal and
/// `diag` on it (restricted to the view's triangle).
pub fn set<T: Scalar>(offdiag: T, diag: T, a: &Matrix<T>, _opts: &Options) -> Result<()> {
    internal::set_local(offdiag, diag, a)?;
    a.tile_update_all_origin()
}

/// Scale `A(i, j) *= r[i] * c[j]` with per-row and per-column real
/// factors (equilibration).
pub fn scale_row_col<T: Scalar>(
    r: &[f64],
    c: &[f64],
    a: &Matrix<T>,
    _opts: &Options,
) -> Result<()> {
    if r.len() != a.m() as usize {
        return Err(Error::invalid_arg("r", "one factor per row required"));
    }
    if c.len() != a.n() as usize {
        return Err(Error::invalid_arg("c", "one factor per column required"));
    }
    internal::scale_row_col_local(r, c, a)?;
    a.tile_update_all_origin()
}
