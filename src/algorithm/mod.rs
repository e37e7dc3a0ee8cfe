//! Algorithm drivers
//!
//! The high-level operations built on the tile runtime: matrix multiply,
//! triangular and band solves, Hermitian updates, Cholesky and QR
//! factorizations, fills and scalings. Every driver validates its
//! arguments synchronously, reserves its wire-tag ranges up front, runs
//! its tile tasks under one task group, and leaves user-visible origin
//! tiles coherent on exit.

mod cholesky;
mod gemm;
mod herk;
pub(crate) mod internal;
mod qr;
mod setscale;
mod trsm;

pub use cholesky::{pbtrf, pbtrs, potrf, potrs};
pub use gemm::gemm;
pub use herk::herk;
pub use qr::{geqrf, unmqr};
pub use setscale::{scale_row_col, set};
pub use trsm::{tbsm, trsm};

use crate::comm::{TagPool, TagRange};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::schedule::{Scheduler, SchedulerConfig};
use std::ops::Deref;
use std::sync::Arc;

/// Build the scheduler for one driver invocation.
///
/// Worker count covers the panel, every lookahead column, and the
/// trailing task, so tasks blocking on communication cannot starve the
/// tasks whose sends they wait for.
pub(crate) fn driver_scheduler(opts: &Options) -> Result<Scheduler> {
    let avail = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    Scheduler::new(SchedulerConfig {
        workers: avail.max(opts.lookahead.max(0) as usize + 3),
        max_panel_threads: opts.max_panel_threads.max(1),
    })
}

/// A driver's shareable reservation of a wire-tag range
#[derive(Clone)]
pub(crate) struct DriverTags(Arc<TagRange>);

impl DriverTags {
    /// Reserve `len` subtags under `salt`, or fail when the matrix is
    /// too large for the 16-bit subtag space.
    pub(crate) fn reserve(pool: &TagPool, salt: u16, len: u32) -> Result<Self> {
        let len = len.max(1);
        if len > u32::from(u16::MAX) + 1 {
            return Err(Error::invalid_arg(
                "matrix",
                format!("{} concurrent tags exceed the 16-bit subtag space", len),
            ));
        }
        Ok(Self(Arc::new(pool.reserve(salt, 0, len))))
    }
}

impl Deref for DriverTags {
    type Target = TagRange;

    fn deref(&self) -> &TagRange {
        &self.0
    }
}
