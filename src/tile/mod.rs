//! Tile: the unit of storage, communication, and computation
//!
//! A [`Tile`] is a pure value: a pointer-plus-stride view into one tile's
//! storage, together with the logical attributes (layout, uplo, op, diag)
//! that alter indexing semantics without moving bytes. Tiles never own
//! memory; the catalog does.

use crate::dtype::Scalar;
use std::fmt;

/// Physical element order within a tile's buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Columns are contiguous; element (i, j) at `i + j * stride`
    ColMajor,
    /// Rows are contiguous; element (i, j) at `i * stride + j`
    RowMajor,
}

/// Which triangle of a tile (or matrix) is meaningful
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Uplo {
    /// Every element is meaningful
    General,
    /// Upper triangle
    Upper,
    /// Lower triangle
    Lower,
}

impl Uplo {
    /// The triangle seen through a transposition
    #[inline]
    pub fn flipped(self) -> Self {
        match self {
            Self::General => Self::General,
            Self::Upper => Self::Lower,
            Self::Lower => Self::Upper,
        }
    }
}

/// Logical transposition applied to a tile or view
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// As stored
    NoTrans,
    /// Transposed
    Trans,
    /// Conjugate-transposed
    ConjTrans,
}

/// Whether a triangular tile has an implicit unit diagonal
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Diag {
    /// Diagonal elements are stored
    NonUnit,
    /// Diagonal elements are implicitly one
    Unit,
}

/// Memory location of a tile instance
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemLoc {
    /// Host memory
    Host,
    /// Device memory, by device index
    Device(u32),
}

impl fmt::Display for MemLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Device(d) => write!(f, "device {}", d),
        }
    }
}

/// View into one tile's storage
///
/// `mb`/`nb` and the buffer are physical; `op` transposes indexing on the
/// fly, so `mb()`/`nb()`/`get()` all speak logical coordinates. Copyable
/// and cheap; validity of the data pointer is the catalog's concern.
pub struct Tile<T> {
    data: *mut T,
    stride: i64,
    mb: i64,
    nb: i64,
    layout: Layout,
    uplo: Uplo,
    op: Op,
    diag: Diag,
    loc: MemLoc,
    origin: bool,
}

impl<T> Clone for Tile<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Tile<T> {}

// A Tile is a raw view; exclusivity of writers is enforced by the
// coherence engine, not the type system.
unsafe impl<T: Send> Send for Tile<T> {}
unsafe impl<T: Sync> Sync for Tile<T> {}

impl<T: Scalar> Tile<T> {
    /// Create a tile view over `data` with physical extent `mb x nb`.
    ///
    /// The stride must cover the leading physical dimension:
    /// `stride >= mb` for ColMajor, `stride >= nb` for RowMajor.
    pub fn new(
        data: *mut T,
        mb: i64,
        nb: i64,
        stride: i64,
        layout: Layout,
        loc: MemLoc,
        origin: bool,
    ) -> Self {
        debug_assert!(mb >= 0 && nb >= 0);
        debug_assert!(match layout {
            Layout::ColMajor => stride >= mb,
            Layout::RowMajor => stride >= nb,
        });
        Self {
            data,
            stride,
            mb,
            nb,
            layout,
            uplo: Uplo::General,
            op: Op::NoTrans,
            diag: Diag::NonUnit,
            loc,
            origin,
        }
    }

    /// Logical number of rows
    #[inline]
    pub fn mb(&self) -> i64 {
        match self.op {
            Op::NoTrans => self.mb,
            _ => self.nb,
        }
    }

    /// Logical number of columns
    #[inline]
    pub fn nb(&self) -> i64 {
        match self.op {
            Op::NoTrans => self.nb,
            _ => self.mb,
        }
    }

    /// Leading dimension of the physical buffer
    #[inline]
    pub fn stride(&self) -> i64 {
        self.stride
    }

    /// Physical element order
    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Logical triangle restriction (follows `op`)
    #[inline]
    pub fn uplo(&self) -> Uplo {
        match self.op {
            Op::NoTrans => self.uplo,
            _ => self.uplo.flipped(),
        }
    }

    /// Logical transposition
    #[inline]
    pub fn op(&self) -> Op {
        self.op
    }

    /// Diagonal kind
    #[inline]
    pub fn diag(&self) -> Diag {
        self.diag
    }

    /// Memory location of the underlying instance
    #[inline]
    pub fn loc(&self) -> MemLoc {
        self.loc
    }

    /// True if this instance is the authoritative user-visible copy
    #[inline]
    pub fn is_origin(&self) -> bool {
        self.origin
    }

    /// Raw data pointer (physical origin of the buffer)
    #[inline]
    pub fn data(&self) -> *mut T {
        self.data
    }

    /// True if the physical buffer has no gaps between lines
    #[inline]
    pub fn is_contiguous(&self) -> bool {
        match self.layout {
            Layout::ColMajor => self.stride == self.mb,
            Layout::RowMajor => self.stride == self.nb,
        }
    }

    /// Transposed view of the same storage
    pub fn transpose(mut self) -> Self {
        self.op = match self.op {
            Op::NoTrans => Op::Trans,
            Op::Trans => Op::NoTrans,
            // conj-transpose of a transpose is conj; not representable
            Op::ConjTrans => unreachable!("transpose of a conj-transposed tile"),
        };
        self
    }

    /// Conjugate-transposed view of the same storage
    pub fn conj_transpose(mut self) -> Self {
        self.op = match self.op {
            Op::NoTrans => Op::ConjTrans,
            Op::ConjTrans => Op::NoTrans,
            Op::Trans => unreachable!("conj-transpose of a transposed tile"),
        };
        self
    }

    /// Same view restricted to a triangle
    pub fn with_uplo(mut self, uplo: Uplo, diag: Diag) -> Self {
        // uplo is stored physically; undo the op flip
        self.uplo = match self.op {
            Op::NoTrans => uplo,
            _ => uplo.flipped(),
        };
        self.diag = diag;
        self
    }

    #[inline]
    fn phys_offset(&self, pi: i64, pj: i64) -> isize {
        debug_assert!(pi >= 0 && pi < self.mb, "row {} out of {}", pi, self.mb);
        debug_assert!(pj >= 0 && pj < self.nb, "col {} out of {}", pj, self.nb);
        match self.layout {
            Layout::ColMajor => (pi + pj * self.stride) as isize,
            Layout::RowMajor => (pi * self.stride + pj) as isize,
        }
    }

    /// Read the logical element (i, j), applying `op`
    #[inline]
    pub fn get(&self, i: i64, j: i64) -> T {
        let (pi, pj, conj) = match self.op {
            Op::NoTrans => (i, j, false),
            Op::Trans => (j, i, false),
            Op::ConjTrans => (j, i, true),
        };
        let v = unsafe { *self.data.offset(self.phys_offset(pi, pj)) };
        if conj {
            v.conj()
        } else {
            v
        }
    }

    /// Write the logical element (i, j), applying `op`
    #[inline]
    pub fn set_elem(&self, i: i64, j: i64, v: T) {
        let (pi, pj, conj) = match self.op {
            Op::NoTrans => (i, j, false),
            Op::Trans => (j, i, false),
            Op::ConjTrans => (j, i, true),
        };
        let v = if conj { v.conj() } else { v };
        unsafe {
            *self.data.offset(self.phys_offset(pi, pj)) = v;
        }
    }

    /// Copy this tile's logical contents into `dst`.
    ///
    /// Logical extents must match; a layout or op mismatch is resolved by
    /// an internal transpose during the copy.
    pub fn copy_to(&self, dst: &Tile<T>) {
        assert_eq!(self.mb(), dst.mb(), "copy_to: row extent mismatch");
        assert_eq!(self.nb(), dst.nb(), "copy_to: col extent mismatch");

        // Fast path: identical physical interpretation, line-wise memcpy.
        if self.op == Op::NoTrans && dst.op == Op::NoTrans && self.layout == dst.layout {
            let (lines, line_len) = match self.layout {
                Layout::ColMajor => (self.nb, self.mb),
                Layout::RowMajor => (self.mb, self.nb),
            };
            for l in 0..lines {
                unsafe {
                    let src = self.data.offset((l * self.stride) as isize);
                    let d = dst.data.offset((l * dst.stride) as isize);
                    std::ptr::copy_nonoverlapping(src, d, line_len as usize);
                }
            }
            return;
        }

        for j in 0..self.nb() {
            for i in 0..self.mb() {
                dst.set_elem(i, j, self.get(i, j));
            }
        }
    }

    /// Fill with a trapezoidal constant pattern: `offdiag` off the
    /// diagonal (restricted to the logical triangle), `diag` on it.
    pub fn set(&self, offdiag: T, diag: T) {
        for j in 0..self.nb() {
            for i in 0..self.mb() {
                if i == j {
                    self.set_elem(i, j, diag);
                } else {
                    let in_tri = match self.uplo() {
                        Uplo::General => true,
                        Uplo::Lower => i > j,
                        Uplo::Upper => i < j,
                    };
                    if in_tri {
                        self.set_elem(i, j, offdiag);
                    }
                }
            }
        }
    }

    /// Copy a logical row segment `(i, j0 .. j0+n)` out to `buf`
    pub fn read_row(&self, i: i64, j0: i64, buf: &mut [T]) {
        debug_assert!(j0 + buf.len() as i64 <= self.nb());
        for (k, slot) in buf.iter_mut().enumerate() {
            *slot = self.get(i, j0 + k as i64);
        }
    }

    /// Copy `buf` into the logical row segment `(i, j0 .. j0+n)`
    pub fn write_row(&self, i: i64, j0: i64, buf: &[T]) {
        for (k, v) in buf.iter().enumerate() {
            self.set_elem(i, j0 + k as i64, *v);
        }
    }

    /// Conjugate a logical row segment in place
    pub fn conjugate_row(&self, i: i64, j0: i64, n: i64) {
        for j in j0..j0 + n {
            self.set_elem(i, j, self.get(i, j).conj());
        }
    }

    /// Serialize physical contents in canonical (column-by-column) order
    pub fn pack_into(&self, out: &mut Vec<u8>) {
        out.reserve((self.mb * self.nb) as usize * std::mem::size_of::<T>());
        let plain = Tile {
            op: Op::NoTrans,
            ..*self
        };
        for j in 0..self.nb {
            for i in 0..self.mb {
                let v = plain.get(i, j);
                out.extend_from_slice(bytemuck::bytes_of(&v));
            }
        }
    }

    /// Deserialize canonical-order bytes into the physical buffer
    pub fn unpack_from(&self, bytes: &[u8]) {
        let elem = std::mem::size_of::<T>();
        assert_eq!(
            bytes.len(),
            (self.mb * self.nb) as usize * elem,
            "unpack_from: byte count mismatch"
        );
        let plain = Tile {
            op: Op::NoTrans,
            ..*self
        };
        let mut at = 0usize;
        for j in 0..self.nb {
            for i in 0..self.mb {
                // wire buffers carry no alignment guarantee
                let v: T = bytemuck::pod_read_unaligned(&bytes[at..at + elem]);
                plain.set_elem(i, j, v);
                at += elem;
            }
        }
    }
}

impl<T: Scalar> fmt::Debug for Tile<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tile {{ {}x{} {:?} {:?} stride {} on {} }}",
            self.mb, self.nb, self.layout, self.op, self.stride, self.loc
        )
    }
}
