//! Typed matrix views: triangular, symmetric, Hermitian, band
//!
//! Casts over a general [`Matrix`] view. They share its storage (a cast
//! is O(1)) and add the structural restriction the drivers dispatch on;
//! triangular and symmetric casts require a square view. Each wrapper
//! derefs to the underlying general view for geometry and tile access.

use super::Matrix;
use crate::dtype::Scalar;
use crate::error::{Error, Result};
use crate::tile::{Diag, Uplo};
use std::ops::Deref;

fn require_square<T: Scalar>(a: &Matrix<T>, what: &'static str) -> Result<()> {
    if a.mt() != a.nt() || a.m() != a.n() {
        return Err(Error::invalid_arg(
            what,
            format!("requires a square view, got {}x{} tiles", a.mt(), a.nt()),
        ));
    }
    Ok(())
}

/// Triangular restriction of a square view
pub struct TriangularMatrix<T: Scalar> {
    base: Matrix<T>,
}

impl<T: Scalar> TriangularMatrix<T> {
    /// Cast a square view to a triangular matrix
    pub fn new(uplo: Uplo, diag: Diag, a: &Matrix<T>) -> Result<Self> {
        require_square(a, "TriangularMatrix")?;
        Ok(Self {
            base: a.with_uplo(uplo, diag),
        })
    }

    /// Conjugate-transposed triangular view (flips the triangle)
    pub fn conj_transpose(&self) -> Self {
        Self {
            base: self.base.conj_transpose(),
        }
    }

    /// The underlying general view (triangle restriction retained)
    pub fn as_general(&self) -> &Matrix<T> {
        &self.base
    }
}

impl<T: Scalar> Deref for TriangularMatrix<T> {
    type Target = Matrix<T>;

    fn deref(&self) -> &Matrix<T> {
        &self.base
    }
}

impl<T: Scalar> Clone for TriangularMatrix<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
        }
    }
}

/// Symmetric restriction of a square view (one triangle stored)
pub struct SymmetricMatrix<T: Scalar> {
    base: Matrix<T>,
}

impl<T: Scalar> SymmetricMatrix<T> {
    /// Cast a square view to a symmetric matrix
    pub fn new(uplo: Uplo, a: &Matrix<T>) -> Result<Self> {
        require_square(a, "SymmetricMatrix")?;
        Ok(Self {
            base: a.with_uplo(uplo, Diag::NonUnit),
        })
    }

    /// The underlying general view
    pub fn as_general(&self) -> &Matrix<T> {
        &self.base
    }
}

impl<T: Scalar> Deref for SymmetricMatrix<T> {
    type Target = Matrix<T>;

    fn deref(&self) -> &Matrix<T> {
        &self.base
    }
}

impl<T: Scalar> Clone for SymmetricMatrix<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
        }
    }
}

/// Hermitian restriction of a square view (one triangle stored)
pub struct HermitianMatrix<T: Scalar> {
    base: Matrix<T>,
}

impl<T: Scalar> HermitianMatrix<T> {
    /// Cast a square view to a Hermitian matrix
    pub fn new(uplo: Uplo, a: &Matrix<T>) -> Result<Self> {
        require_square(a, "HermitianMatrix")?;
        Ok(Self {
            base: a.with_uplo(uplo, Diag::NonUnit),
        })
    }

    /// The underlying general view
    pub fn as_general(&self) -> &Matrix<T> {
        &self.base
    }
}

impl<T: Scalar> Deref for HermitianMatrix<T> {
    type Target = Matrix<T>;

    fn deref(&self) -> &Matrix<T> {
        &self.base
    }
}

impl<T: Scalar> Clone for HermitianMatrix<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
        }
    }
}

/// Band restriction: elements outside `kl` sub- and `ku` super-diagonals
/// are implicitly zero
pub struct BandMatrix<T: Scalar> {
    base: Matrix<T>,
    kl: i64,
    ku: i64,
}

/// True when tile `(i, j)` of `a` intersects the band `(kl, ku)`
pub(crate) fn tile_in_band<T: Scalar>(a: &Matrix<T>, i: i64, j: i64, kl: i64, ku: i64) -> bool {
    let r0: i64 = (0..i).map(|k| a.tile_mb(k)).sum();
    let c0: i64 = (0..j).map(|k| a.tile_nb(k)).sum();
    let r1 = r0 + a.tile_mb(i) - 1;
    let c1 = c0 + a.tile_nb(j) - 1;
    c1 >= r0 - kl && c0 <= r1 + ku
}

impl<T: Scalar> BandMatrix<T> {
    /// Cast a view to a band matrix with `kl` sub- and `ku`
    /// super-diagonals
    pub fn new(kl: i64, ku: i64, a: &Matrix<T>) -> Result<Self> {
        if kl < 0 || ku < 0 {
            return Err(Error::invalid_arg("kl/ku", "bandwidths must be non-negative"));
        }
        Ok(Self {
            base: a.clone(),
            kl,
            ku,
        })
    }

    /// Sub-diagonal bandwidth
    pub fn kl(&self) -> i64 {
        self.kl
    }

    /// Super-diagonal bandwidth
    pub fn ku(&self) -> i64 {
        self.ku
    }

    /// True when tile `(i, j)` intersects the band
    pub fn tile_in_band(&self, i: i64, j: i64) -> bool {
        tile_in_band(&self.base, i, j, self.kl, self.ku)
    }

    /// The underlying general view
    pub fn as_general(&self) -> &Matrix<T> {
        &self.base
    }
}

impl<T: Scalar> Deref for BandMatrix<T> {
    type Target = Matrix<T>;

    fn deref(&self) -> &Matrix<T> {
        &self.base
    }
}

/// Triangular band matrix (one triangle, `kd` off-diagonals)
pub struct TriangularBandMatrix<T: Scalar> {
    base: Matrix<T>,
    kd: i64,
}

impl<T: Scalar> TriangularBandMatrix<T> {
    /// Cast a square view to a triangular band matrix
    pub fn new(uplo: Uplo, diag: Diag, kd: i64, a: &Matrix<T>) -> Result<Self> {
        require_square(a, "TriangularBandMatrix")?;
        if kd < 0 {
            return Err(Error::invalid_arg("kd", "bandwidth must be non-negative"));
        }
        Ok(Self {
            base: a.with_uplo(uplo, diag),
            kd,
        })
    }

    /// Bandwidth (off-diagonals on the stored side)
    pub fn kd(&self) -> i64 {
        self.kd
    }

    /// True when tile `(i, j)` intersects the stored band
    pub fn tile_in_band(&self, i: i64, j: i64) -> bool {
        let (kl, ku) = match self.base.uplo() {
            Uplo::Lower => (self.kd, 0),
            Uplo::Upper => (0, self.kd),
            Uplo::General => (self.kd, self.kd),
        };
        tile_in_band(&self.base, i, j, kl, ku)
    }

    /// Conjugate-transposed band view (flips the triangle)
    pub fn conj_transpose(&self) -> Self {
        Self {
            base: self.base.conj_transpose(),
            kd: self.kd,
        }
    }
}

impl<T: Scalar> Deref for TriangularBandMatrix<T> {
    type Target = Matrix<T>;

    fn deref(&self) -> &Matrix<T> {
        &self.base
    }
}

impl<T: Scalar> Clone for TriangularBandMatrix<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            kd: self.kd,
        }
    }
}

/// Hermitian band matrix (one triangle stored, `kd` off-diagonals)
pub struct HermitianBandMatrix<T: Scalar> {
    base: Matrix<T>,
    kd: i64,
}

impl<T: Scalar> HermitianBandMatrix<T> {
    /// Cast a square view to a Hermitian band matrix
    pub fn new(uplo: Uplo, kd: i64, a: &Matrix<T>) -> Result<Self> {
        require_square(a, "HermitianBandMatrix")?;
        if kd < 0 {
            return Err(Error::invalid_arg("kd", "bandwidth must be non-negative"));
        }
        Ok(Self {
            base: a.with_uplo(uplo, Diag::NonUnit),
            kd,
        })
    }

    /// Bandwidth (off-diagonals on the stored side)
    pub fn kd(&self) -> i64 {
        self.kd
    }

    /// The triangular band factor view over the same storage
    pub fn triangular(&self, diag: Diag) -> TriangularBandMatrix<T> {
        TriangularBandMatrix {
            base: self.base.with_uplo(self.base.uplo(), diag),
            kd: self.kd,
        }
    }

    /// True when tile `(i, j)` intersects the stored band
    pub fn tile_in_band(&self, i: i64, j: i64) -> bool {
        let (kl, ku) = match self.base.uplo() {
            Uplo::Lower => (self.kd, 0),
            Uplo::Upper => (0, self.kd),
            Uplo::General => (self.kd, self.kd),
        };
        tile_in_band(&self.base, i, j, kl, ku)
    }

    /// The underlying general view
    pub fn as_general(&self) -> &Matrix<T> {
        &self.base
    }
}

impl<T: Scalar> Deref for HermitianBandMatrix<T> {
    type Target = Matrix<T>;

    fn deref(&self) -> &Matrix<T> {
        &self.base
    }
}

/// The two triangular-factor matrices produced by QR
///
/// `local` holds the block-reflector `T` factors of the per-rank panel
/// factorizations; `reduce` holds those of the triangle-triangle
/// reduction. Both share the panel matrix's distribution.
pub struct TriangularFactors<T: Scalar> {
    /// Panel-factorization `T` factors
    pub local: Matrix<T>,
    /// Triangle-triangle reduction `T` factors
    pub reduce: Matrix<T>,
}

impl<T: Scalar> TriangularFactors<T> {
    /// Allocate factor matrices matching `a`'s geometry
    pub fn new(a: &Matrix<T>) -> Result<Self> {
        Ok(Self {
            local: a.empty_like()?,
            reduce: a.empty_like()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ChannelTransport, Transport};
    use std::sync::Arc;

    fn square(n: i64, nb: i64) -> Matrix<f64> {
        let t: Arc<dyn Transport> = ChannelTransport::solo();
        let a = Matrix::new(n, n, nb, 1, 1, t).unwrap();
        a.insert_local_tiles().unwrap();
        a
    }

    #[test]
    fn test_triangular_cast_requires_square() {
        let t: Arc<dyn Transport> = ChannelTransport::solo();
        let rect: Matrix<f64> = Matrix::new(8, 4, 4, 1, 1, t).unwrap();
        assert!(TriangularMatrix::new(Uplo::Lower, Diag::NonUnit, &rect).is_err());

        let sq = square(8, 4);
        let l = TriangularMatrix::new(Uplo::Lower, Diag::Unit, &sq).unwrap();
        assert_eq!(l.uplo(), Uplo::Lower);
        assert_eq!(l.diag(), Diag::Unit);
    }

    #[test]
    fn test_conj_transpose_flips_triangle() {
        let sq = square(8, 4);
        let l = TriangularMatrix::new(Uplo::Lower, Diag::NonUnit, &sq).unwrap();
        let lt = l.conj_transpose();
        assert_eq!(lt.uplo(), Uplo::Upper);
    }

    #[test]
    fn test_diagonal_tiles_carry_uplo() {
        let sq = square(8, 4);
        let h = HermitianMatrix::new(Uplo::Lower, &sq).unwrap();
        let d = h.tile(1, 1).unwrap();
        assert_eq!(d.uplo(), Uplo::Lower);
        drop(d);
        let off = h.tile(1, 0).unwrap();
        assert_eq!(off.uplo(), Uplo::General);
    }

    #[test]
    fn test_band_membership() {
        let sq = square(16, 4);
        // one tile of sub-diagonal bandwidth
        let b = HermitianBandMatrix::new(Uplo::Lower, 4, &sq).unwrap();
        assert!(b.tile_in_band(0, 0));
        assert!(b.tile_in_band(1, 0));
        assert!(!b.tile_in_band(2, 0));
        assert!(b.tile_in_band(3, 3));

        let l = b.triangular(Diag::NonUnit);
        let lt = l.conj_transpose();
        assert_eq!(lt.uplo(), Uplo::Upper);
        assert!(lt.tile_in_band(0, 1));
        assert!(!lt.tile_in_band(0, 2));
        assert!(!lt.tile_in_band(1, 0));
    }

    #[test]
    fn test_symmetric_and_band_casts() {
        let sq = square(12, 4);
        let s = SymmetricMatrix::new(Uplo::Upper, &sq).unwrap();
        assert_eq!(s.uplo(), Uplo::Upper);
        assert_eq!(s.as_general().nt(), 3);

        let b = BandMatrix::new(4, 8, &sq).unwrap();
        assert_eq!((b.kl(), b.ku()), (4, 8));
        assert!(b.tile_in_band(1, 0));
        assert!(b.tile_in_band(0, 2));
        assert!(!b.tile_in_band(2, 0));
    }

    #[test]
    fn test_triangular_factors_geometry() {
        let sq = square(8, 4);
        let t = TriangularFactors::new(&sq).unwrap();
        assert_eq!(t.local.mt(), 2);
        assert_eq!(t.reduce.nt(), 2);
        assert!(!t.local.shares_storage(&sq));
    }
}
