//! Error types for tilr

use thiserror::Error;

/// Result type alias using tilr's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tilr operations
///
/// Only `Numerical` is a routine, user-visible outcome; the transport,
/// device, and invariant kinds indicate conditions the runtime cannot
/// recover from and are surfaced so the caller can tear down the process.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid argument provided to a driver or runtime entry point
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Memory pool or backing allocator exhaustion
    #[error("Out of memory: failed to allocate {size} bytes on {location}")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
        /// Memory location description ("host" or "device N")
        location: String,
    },

    /// Message-layer failure (send, receive, or collective)
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Device kernel or DMA failure
    #[error("Device failure: {0}")]
    Device(String),

    /// Coherence-protocol or dependency-tracking bug; always a defect
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Numerical breakdown reported by a factorization
    ///
    /// `info` follows the LAPACK convention: the 1-based index of the
    /// first pivot that failed.
    #[error("Numerical failure: info = {info}")]
    Numerical {
        /// 1-based index of the failing pivot
        info: i64,
    },

    /// Feature combination not supported by this build
    #[error("Not implemented: {feature}")]
    NotImplemented {
        /// Description of the unimplemented feature
        feature: &'static str,
    },
}

impl Error {
    /// Create an invalid-argument error
    pub fn invalid_arg(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Create an internal-invariant error
    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InternalInvariant(reason.into())
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport(reason.into())
    }

    /// True for errors that indicate a condition the algorithm cannot
    /// continue past but the process can report and survive.
    pub fn is_numerical(&self) -> bool {
        matches!(self, Self::Numerical { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::invalid_arg("nb", "must be positive");
        assert_eq!(e.to_string(), "Invalid argument 'nb': must be positive");

        let e = Error::Numerical { info: 3 };
        assert!(e.is_numerical());
        assert_eq!(e.to_string(), "Numerical failure: info = 3");
    }
}
