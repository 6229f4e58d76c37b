//! # Despachar
//!
//! Native kernel-dispatch core for compiled numerical programs. Despachar
//! (Spanish: "to dispatch") sits between a managed execution environment and
//! hardware-optimized numerical routines, crossing the boundary through a
//! narrow, exception-free ABI.
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------+
//! |   external executor          |  <- decides what runs, inspects status
//! +------------------------------+
//! |   DispatchContext::dispatch  |  <- name lookup, panic boundary
//! +------------------------------+
//! |   kernel implementations     |  <- decode, validate, compute in place
//! +--------------+---------------+
//! |  HandlePool  |  Descriptor   |  <- pooled device state, binary codec
//! +--------------+---------------+
//! ```
//!
//! Three load-bearing pieces:
//!
//! - **[`HandlePool`]**: a bounded, thread-safe pool of expensive per-device
//!   library handles, borrowed one caller at a time through RAII guards.
//! - **Descriptor codec**: [`FactorDescriptor`] and [`FftDescriptor`] encode
//!   a call site's shapes, strides, and algorithm variant into fixed-layout
//!   bytes at compile time; dispatch decodes them with no string parsing.
//! - **[`StatusSlot`]**: the out-of-band status channel kernels report
//!   through instead of raising; nothing unwinds past
//!   [`DispatchContext::dispatch`].
//!
//! ## Example
//!
//! ```rust
//! use despachar::{
//!     AlgorithmVariant, DType, DeviceKey, DispatchContext, FactorDescriptor,
//!     PoolConfig, StatusSlot,
//! };
//!
//! let ctx = DispatchContext::with_builtins(PoolConfig::default()).unwrap();
//!
//! // Compile time: encode the call's parameters once.
//! let desc = FactorDescriptor {
//!     dtype: DType::F64,
//!     variant: AlgorithmVariant(0), // lower triangle
//!     batch: 1,
//!     rows: 2,
//!     cols: 2,
//!     lead_dim: 2,
//!     workspace_bytes: 0,
//! };
//! let desc_bytes = desc.encode().unwrap();
//!
//! // Dispatch time: buffers in, status out.
//! let a = [4.0f64, 2.0, 2.0, 5.0];
//! let mut factor = [0.0f64; 4];
//! let mut info = [0i32; 1];
//! let mut outputs: Vec<&mut [u8]> = vec![
//!     bytemuck::cast_slice_mut(&mut factor),
//!     bytemuck::cast_slice_mut(&mut info),
//! ];
//! let mut status = StatusSlot::new();
//! ctx.dispatch(
//!     "cholesky",
//!     DeviceKey::default(),
//!     &desc_bytes,
//!     &[bytemuck::cast_slice(&a)],
//!     &mut outputs,
//!     &mut status,
//! );
//! assert!(status.is_ok());
//! assert_eq!(info[0], 0);
//! ```
//!
//! ## What this crate does not do
//!
//! No scheduling, no RPC, no cross-process state, no retry logic. The core
//! executes synchronously inside a single native call; deciding when and
//! where to run — and what to do with a failure status — belongs to the
//! executor above it.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)] // Guard invariants documented inline
#![allow(clippy::missing_errors_doc)] // Error conditions live in the type docs
#![allow(clippy::cast_possible_truncation)] // Checked at the codec boundary
#![allow(clippy::many_single_char_names)] // Matrix indices are standard notation
#![allow(clippy::similar_names)] // apq/apk etc. follow the literature
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::useless_vec)] // Test fixtures read clearer as vecs

/// Binary descriptor codec: call-site parameters to fixed-layout bytes
pub mod descriptor;
/// Kernel registry, dispatch table, and the dispatch entry point
pub mod dispatch;
pub mod error;
/// Builtin decomposition and transform kernels
pub mod kernels;
/// Bounded per-device pools of reusable library handles
pub mod pool;
/// Out-of-band status channel crossing the ABI
pub mod status;

// Re-exports for convenience
pub use descriptor::{
    AlgorithmVariant, DType, FactorDescriptor, FftDescriptor, FftKind, DESCRIPTOR_VERSION,
    FACTOR_DESCRIPTOR_LEN, FFT_DESCRIPTOR_HEADER_LEN,
};
pub use dispatch::{DispatchContext, KernelFn, KernelInfo, KernelRegistry};
pub use error::{DespacharError, Result};
pub use kernels::register_builtin_kernels;
pub use pool::{DeviceHandle, DeviceKey, HandleGuard, HandlePool, PoolConfig, PoolStats};
pub use status::{Status, StatusCode, StatusSlot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
