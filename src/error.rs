//! Error types for the dispatch core.
//!
//! Every failure inside the crate is a [`DespacharError`]. Nothing is ever
//! allowed to unwind across the dispatch boundary: errors are converted into
//! a [`StatusCode`] written to the caller's status slot before control
//! returns. The [`DespacharError::status_code`] mapping is the single place
//! that translation lives.

use thiserror::Error;

use crate::pool::DeviceKey;
use crate::status::StatusCode;

/// Result type for despachar operations
pub type Result<T> = std::result::Result<T, DespacharError>;

/// Error type for all dispatch-core operations
#[derive(Debug, Error)]
pub enum DespacharError {
    /// A descriptor field does not fit its fixed-width wire encoding.
    /// Raised at encode time (build time), never on the dispatch hot path.
    #[error("descriptor field `{field}` value {value} overflows its {width}-bit encoding")]
    DescriptorOverflow {
        /// Name of the offending field
        field: &'static str,
        /// Value that did not fit
        value: usize,
        /// Width of the wire field in bits
        width: u8,
    },

    /// A descriptor byte sequence does not decode under the declared layout
    #[error("malformed descriptor: {reason}")]
    DescriptorMalformed {
        /// Why decoding was rejected
        reason: String,
    },

    /// A caller-supplied buffer disagrees with the size the descriptor implies
    #[error("{kernel}: `{buffer}` buffer holds {actual} bytes, descriptor implies {expected}")]
    BufferMismatch {
        /// Kernel performing the defensive re-check
        kernel: &'static str,
        /// Which buffer failed the check
        buffer: &'static str,
        /// Byte length the descriptor implies
        expected: usize,
        /// Byte length actually supplied
        actual: usize,
    },

    /// A caller-supplied buffer cannot be viewed as the element type the
    /// descriptor declares (misaligned or not a whole number of elements)
    #[error("{kernel}: `{buffer}` buffer is not viewable as {dtype} elements")]
    BufferCast {
        /// Kernel that attempted the view
        kernel: &'static str,
        /// Which buffer failed
        buffer: &'static str,
        /// Element type requested
        dtype: &'static str,
    },

    /// Wrong number of input or output buffers for the kernel
    #[error("{kernel}: expected {expected} {role} buffers, got {actual}")]
    BufferCount {
        /// Kernel that rejected the call
        kernel: &'static str,
        /// "input" or "output"
        role: &'static str,
        /// Buffer count the kernel requires
        expected: usize,
        /// Buffer count actually supplied
        actual: usize,
    },

    /// Dispatch was asked for a kernel name nobody registered
    #[error("unknown kernel `{name}`")]
    UnknownKernel {
        /// The name that missed the registry
        name: String,
    },

    /// A second registration attempted to reuse an existing kernel name.
    /// Startup-fatal: the registry is append-only and names are stable keys.
    #[error("kernel `{name}` is already registered")]
    DuplicateKernel {
        /// The contested name
        name: String,
    },

    /// A pool mutex was poisoned by a panicking holder
    #[error("handle pool for {key} is poisoned")]
    PoolPoisoned {
        /// Device key of the affected pool
        key: DeviceKey,
    },

    /// A handle came back to a pool with no outstanding borrow recorded.
    /// Programming error; the pool refuses further service rather than
    /// silently absorbing it.
    #[error("handle returned to {key} with no outstanding borrow")]
    ReleaseUnderflow {
        /// Device key of the affected pool
        key: DeviceKey,
    },

    /// Invariant violation or an underlying routine failing unexpectedly
    #[error("internal error: {reason}")]
    Internal {
        /// Description of the violated expectation
        reason: String,
    },
}

impl DespacharError {
    /// Map this error onto the status code reported across the ABI.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DescriptorOverflow { .. }
            | Self::DescriptorMalformed { .. }
            | Self::BufferMismatch { .. }
            | Self::BufferCast { .. }
            | Self::BufferCount { .. } => StatusCode::InvalidArgument,
            Self::UnknownKernel { .. } => StatusCode::Unimplemented,
            Self::DuplicateKernel { .. }
            | Self::PoolPoisoned { .. }
            | Self::ReleaseUnderflow { .. }
            | Self::Internal { .. } => StatusCode::Internal,
        }
    }

    /// Shorthand for an [`DespacharError::Internal`] with a formatted reason
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}
