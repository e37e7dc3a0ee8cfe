//! Scalar trait connecting Rust types to the runtime type system

use super::{Complex32, Complex64, ScalarType};
use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

/// Trait for types that can be elements of a tiled matrix
///
/// Supplies the runtime tag plus the small arithmetic surface the
/// reference kernels and the pivot engine need. Implemented for `f32`,
/// `f64`, [`Complex32`], and [`Complex64`]; kernels are monomorphised per
/// implementation.
pub trait Scalar:
    Copy
    + Clone
    + Send
    + Sync
    + PartialEq
    + fmt::Debug
    + fmt::Display
    + Pod
    + Zeroable
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + 'static
{
    /// The corresponding runtime tag for this Rust type
    const SCALAR_TYPE: ScalarType;

    /// Zero value
    fn zero() -> Self;

    /// One value
    fn one() -> Self;

    /// Complex conjugate; identity for real types
    fn conj(self) -> Self;

    /// Magnitude as f64
    fn abs(self) -> f64;

    /// Real part as f64
    fn real(self) -> f64;

    /// Imaginary part as f64; zero for real types
    fn imag(self) -> f64;

    /// Construct from a real value
    fn from_real(re: f64) -> Self;

    /// Construct from real and imaginary parts
    ///
    /// The imaginary part is discarded for real types.
    fn from_parts(re: f64, im: f64) -> Self;
}

impl Scalar for f32 {
    const SCALAR_TYPE: ScalarType = ScalarType::R32;

    #[inline]
    fn zero() -> Self {
        0.0
    }

    #[inline]
    fn one() -> Self {
        1.0
    }

    #[inline]
    fn conj(self) -> Self {
        self
    }

    #[inline]
    fn abs(self) -> f64 {
        f64::from(self).abs()
    }

    #[inline]
    fn real(self) -> f64 {
        f64::from(self)
    }

    #[inline]
    fn imag(self) -> f64 {
        0.0
    }

    #[inline]
    fn from_real(re: f64) -> Self {
        re as f32
    }

    #[inline]
    fn from_parts(re: f64, _im: f64) -> Self {
        re as f32
    }
}

impl Scalar for f64 {
    const SCALAR_TYPE: ScalarType = ScalarType::R64;

    #[inline]
    fn zero() -> Self {
        0.0
    }

    #[inline]
    fn one() -> Self {
        1.0
    }

    #[inline]
    fn conj(self) -> Self {
        self
    }

    #[inline]
    fn abs(self) -> f64 {
        self.abs()
    }

    #[inline]
    fn real(self) -> f64 {
        self
    }

    #[inline]
    fn imag(self) -> f64 {
        0.0
    }

    #[inline]
    fn from_real(re: f64) -> Self {
        re
    }

    #[inline]
    fn from_parts(re: f64, _im: f64) -> Self {
        re
    }
}

impl Scalar for Complex32 {
    const SCALAR_TYPE: ScalarType = ScalarType::C32;

    #[inline]
    fn zero() -> Self {
        Self::ZERO
    }

    #[inline]
    fn one() -> Self {
        Self::ONE
    }

    #[inline]
    fn conj(self) -> Self {
        self.conj()
    }

    #[inline]
    fn abs(self) -> f64 {
        f64::from(self.abs())
    }

    #[inline]
    fn real(self) -> f64 {
        f64::from(self.re)
    }

    #[inline]
    fn imag(self) -> f64 {
        f64::from(self.im)
    }

    #[inline]
    fn from_real(re: f64) -> Self {
        Self::new(re as f32, 0.0)
    }

    #[inline]
    fn from_parts(re: f64, im: f64) -> Self {
        Self::new(re as f32, im as f32)
    }
}

impl Scalar for Complex64 {
    const SCALAR_TYPE: ScalarType = ScalarType::C64;

    #[inline]
    fn zero() -> Self {
        Self::ZERO
    }

    #[inline]
    fn one() -> Self {
        Self::ONE
    }

    #[inline]
    fn conj(self) -> Self {
        self.conj()
    }

    #[inline]
    fn abs(self) -> f64 {
        self.abs()
    }

    #[inline]
    fn real(self) -> f64 {
        self.re
    }

    #[inline]
    fn imag(self) -> f64 {
        self.im
    }

    #[inline]
    fn from_real(re: f64) -> Self {
        Self::new(re, 0.0)
    }

    #[inline]
    fn from_parts(re: f64, im: f64) -> Self {
        Self::new(re, im)
    }
}
