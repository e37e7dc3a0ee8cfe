//! # tilr
//!
//! **Distributed tiled dense linear algebra runtime.**
//!
//! tilr stores matrices as two-dimensional grids of tiles distributed
//! block-cyclically across a process mesh, tracks where up-to-date
//! copies of every tile live (host, devices, remote ranks) under a
//! MOSI coherence protocol, schedules tile-granular tasks with
//! lookahead, and moves data through broadcast and reduction trees
//! overlapped with computation.
//!
//! ## Architecture
//!
//! ```text
//! algorithm drivers (potrf, geqrf, trsm, ...)
//! ├── matrix      views over a shared tile catalog
//! ├── schedule    fork-join task graph, block-column dependencies
//! ├── coherence   MOSI transitions on (tile, location) instances
//! │   ├── catalog  (i, j) -> instances, per-tile locks
//! │   └── memory   pooled tile slabs per location
//! ├── comm        tile send/recv, broadcast & reduction trees, tags
//! ├── batch       per-device pointer-array marshalling
//! ├── device      accelerator seam (host-staged by default)
//! └── kernel      black-box tile kernels (reference host set)
//! ```
//!
//! Dense tile kernels and the MPI transport are external collaborators:
//! both are trait seams ([`kernel::TileKernels`], [`comm::Transport`])
//! with in-process implementations used by tests and single-process
//! runs.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tilr::prelude::*;
//!
//! let transport = ChannelTransport::solo();
//! let a: Matrix<f64> = Matrix::new(256, 256, 64, 1, 1, transport)?;
//! a.insert_local_tiles()?;
//! // ... fill tiles ...
//! let h = HermitianMatrix::new(Uplo::Lower, &a)?;
//! tilr::algorithm::potrf(&h, &Options::default())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]
#![allow(clippy::too_many_arguments)]

pub mod algorithm;
pub mod batch;
pub mod catalog;
pub mod coherence;
pub mod comm;
pub mod device;
pub mod dtype;
pub mod error;
pub mod kernel;
pub mod matrix;
pub mod memory;
mod options;
pub mod pivot;
pub mod schedule;
pub mod tile;
pub mod trace;

pub use options::{Options, Target};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::comm::{ChannelTransport, Transport};
    pub use crate::dtype::{Complex32, Complex64, Scalar, ScalarType};
    pub use crate::error::{Error, Result};
    pub use crate::matrix::{
        HermitianBandMatrix, HermitianMatrix, Matrix, SymmetricMatrix, TriangularBandMatrix,
        TriangularFactors, TriangularMatrix,
    };
    pub use crate::pivot::{Direction, Pivot};
    pub use crate::tile::{Diag, Layout, MemLoc, Op, Tile, Uplo};
    pub use crate::{Options, Target};
}
